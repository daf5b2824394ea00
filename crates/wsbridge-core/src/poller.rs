//! Dedicated thread that drives a polled engine.
//!
//! A [`PollWorker`] repeatedly calls [`Pollable::poll`] until it is told to
//! stop or the target reports itself stopped. Once the main loop ends, a
//! bounded grace loop keeps polling until the target stops, so an in-flight
//! close handshake can still complete and fire its callbacks.
//!
//! The worker never runs user code itself; whatever the target does from
//! inside `poll` (typically invoking engine callbacks) runs on this thread.
//! When the thread ends, normally or because `poll` panicked, the optional
//! exit handler is told how it ended.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use wsbridge_core::poller::{PollWorker, Pollable, PollerConfig};
//!
//! struct Countdown(AtomicU64);
//!
//! impl Pollable for Countdown {
//!     fn poll(&self) -> u64 {
//!         let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
//!         1
//!     }
//!     fn stopped(&self) -> bool {
//!         self.0.load(Ordering::Acquire) == 0
//!     }
//! }
//!
//! let target = Arc::new(Countdown(AtomicU64::new(5)));
//! let worker = PollWorker::start(PollerConfig::with_name("doc-poll"), target.clone(), None).unwrap();
//! worker.dispose();
//! ```

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::logging::{panic_message, targets};
use crate::thread_check::{ThreadAffinity, ThreadRole, enter_role};

/// Default pause between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default number of grace polls after a stop request.
pub const DEFAULT_GRACE_ITERATIONS: u32 = 1000;

/// Something that makes progress when polled.
pub trait Pollable: Send + Sync {
    /// Perform whatever work is ready. Returns the number of handlers run.
    fn poll(&self) -> u64;

    /// `true` once the target has nothing left to do.
    fn stopped(&self) -> bool;
}

/// How a poll thread ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollExit {
    /// The loops ran to completion. `target_stopped` is `false` when the
    /// grace loop ran out before the target stopped.
    Finished {
        /// Whether the target reported itself stopped.
        target_stopped: bool,
    },
    /// `poll` panicked with the given message.
    Panicked(String),
}

/// Called once, as the last thing the poll thread does.
pub type ExitHandler = Box<dyn FnOnce(PollExit) + Send + 'static>;

/// Configuration for a [`PollWorker`] thread.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Name for the poll thread.
    pub name: String,
    /// Id of the object the worker polls for; the thread is tagged with
    /// [`ThreadRole::Poller`] for this owner.
    pub owner: u64,
    /// Pause between polls.
    pub interval: Duration,
    /// Maximum number of polls after the main loop ends.
    pub grace_iterations: u32,
    /// Stack size for the thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: "wsbridge-poll".to_string(),
            owner: 0,
            interval: DEFAULT_POLL_INTERVAL,
            grace_iterations: DEFAULT_GRACE_ITERATIONS,
            stack_size: None,
        }
    }
}

impl PollerConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the owner id.
    pub fn owner(mut self, owner: u64) -> Self {
        self.owner = owner;
        self
    }

    /// Set the pause between polls.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of grace polls.
    pub fn grace_iterations(mut self, iterations: u32) -> Self {
        self.grace_iterations = iterations;
        self
    }
}

/// A thread polling one target until stopped.
///
/// Dropping the worker requests a stop but does not wait for the thread;
/// use [`dispose`](Self::dispose) to join it.
pub struct PollWorker {
    handle: Option<JoinHandle<()>>,
    affinity: ThreadAffinity,
    stop: Arc<AtomicBool>,
    name: String,
}

impl PollWorker {
    /// Spawn the poll thread for `target`.
    pub fn start(
        config: PollerConfig,
        target: Arc<dyn Pollable>,
        on_exit: Option<ExitHandler>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let name = config.name.clone();
        let handle = builder.spawn(move || {
            let _role = enter_role(config.owner, ThreadRole::Poller);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                poll_loop(target.as_ref(), &thread_stop, &config)
            }));
            let exit = match outcome {
                Ok(()) => PollExit::Finished {
                    target_stopped: target.stopped(),
                },
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(target: targets::POLLER, name = %config.name, panic = %message, "poll panicked");
                    PollExit::Panicked(message)
                }
            };
            if let Some(on_exit) = on_exit {
                on_exit(exit);
            }
        })?;

        tracing::debug!(target: targets::POLLER, name = %name, "poll worker started");

        Ok(Self {
            affinity: ThreadAffinity::of(handle.thread()),
            handle: Some(handle),
            stop,
            name,
        })
    }

    /// The poll thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the thread to leave its main loop. Non-blocking.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Check if the poll thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Check if the caller is running on the poll thread.
    pub fn is_current_thread(&self) -> bool {
        self.affinity.is_same_thread()
    }

    /// Stop the worker and wait for its thread to exit.
    ///
    /// From the poll thread itself this only signals. A panicked thread is
    /// logged and otherwise ignored. Returns `true` if the thread was joined.
    pub fn dispose(mut self) -> bool {
        self.signal_stop();
        if self.is_current_thread() {
            tracing::debug!(target: targets::POLLER, name = %self.name, "dispose on poll thread, not joining");
            return false;
        }
        match self.handle.take() {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::debug!(target: targets::POLLER, name = %self.name, "poll thread panicked");
                } else {
                    tracing::debug!(target: targets::POLLER, name = %self.name, "poll worker joined");
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        // Don't block in drop - just request shutdown
        self.signal_stop();
    }
}

fn poll_loop(target: &dyn Pollable, stop: &AtomicBool, config: &PollerConfig) {
    while !stop.load(Ordering::Acquire) && !target.stopped() {
        target.poll();
        thread::sleep(config.interval);
    }

    if !target.stopped() {
        tracing::debug!(target: targets::POLLER, name = %config.name, "stopping, waiting for close handshake");
    }

    for _ in 0..config.grace_iterations {
        if target.stopped() {
            break;
        }
        target.poll();
        thread::sleep(config.interval);
    }
    tracing::debug!(target: targets::POLLER, name = %config.name, stopped = target.stopped(), "poll loop finished");
}
