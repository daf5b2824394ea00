//! Correlation of liveness pings with their pongs.
//!
//! A blocking probe registers its payload *before* the ping goes out, so a
//! pong that arrives immediately can never be missed. Each registration owns
//! a shared outcome slot: the pong callback marks it answered, connection
//! teardown marks it abandoned, and a waiter that runs out of time removes
//! its own entry so nothing leaks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wsbridge_core::logging::targets;

const WAITING: u8 = 0;
const ANSWERED: u8 = 1;
const ABANDONED: u8 = 2;

/// Final state of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingOutcome {
    /// The matching pong arrived.
    Answered,
    /// The connection was torn down first.
    Abandoned,
    /// The deadline passed.
    TimedOut,
}

struct PendingPing {
    payload: Vec<u8>,
    outcome: Arc<AtomicU8>,
}

/// A registered probe, used to wait for or cancel it.
#[derive(Debug)]
pub struct PingTicket {
    outcome: Arc<AtomicU8>,
}

/// The set of outstanding probes and the time of the last matched pong.
#[derive(Default)]
pub struct PingCorrelator {
    pending: Mutex<Vec<PendingPing>>,
    last_pong: Mutex<Option<Instant>>,
}

impl PingCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload. Duplicates are allowed; each pong answers the
    /// oldest matching entry.
    pub fn register(&self, payload: Vec<u8>) -> PingTicket {
        let outcome = Arc::new(AtomicU8::new(WAITING));
        self.pending.lock().push(PendingPing {
            payload,
            outcome: outcome.clone(),
        });
        PingTicket { outcome }
    }

    /// Remove a probe's entry. Returns `false` if it was already resolved.
    pub fn cancel(&self, ticket: &PingTicket) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| Arc::ptr_eq(&p.outcome, &ticket.outcome)) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Offer an incoming pong. Returns `true` if it answered a probe, in which
    /// case it must not be surfaced to the application.
    pub fn match_pong(&self, payload: &[u8]) -> bool {
        let matched = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|p| p.payload == payload)
                .map(|index| pending.remove(index))
        };
        match matched {
            Some(ping) => {
                *self.last_pong.lock() = Some(Instant::now());
                ping.outcome.store(ANSWERED, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Release every waiter; each observes [`PingOutcome::Abandoned`].
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<PendingPing> = self.pending.lock().drain(..).collect();
        for ping in &drained {
            ping.outcome.store(ABANDONED, Ordering::Release);
        }
        if !drained.is_empty() {
            tracing::debug!(target: targets::PING, count = drained.len(), "abandoned pending pings");
        }
        drained.len()
    }

    /// Wait for a probe to resolve, checking every `interval`. On timeout the
    /// entry is removed.
    pub fn wait(&self, ticket: &PingTicket, timeout: Duration, interval: Duration) -> PingOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            match ticket.outcome.load(Ordering::Acquire) {
                ANSWERED => return PingOutcome::Answered,
                ABANDONED => return PingOutcome::Abandoned,
                _ => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(interval);
        }

        if self.cancel(ticket) {
            return PingOutcome::TimedOut;
        }
        // Resolved between the last check and the cancel.
        match ticket.outcome.load(Ordering::Acquire) {
            ANSWERED => PingOutcome::Answered,
            _ => PingOutcome::Abandoned,
        }
    }

    /// Number of outstanding probes.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check whether a payload is outstanding.
    pub fn is_pending(&self, payload: &[u8]) -> bool {
        self.pending.lock().iter().any(|p| p.payload == payload)
    }

    /// When the last probe was answered.
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    /// Check whether a probe was answered within `window`.
    pub fn answered_within(&self, window: Duration) -> bool {
        self.last_pong().is_some_and(|at| at.elapsed() < window)
    }
}
