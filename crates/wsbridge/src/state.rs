//! Connection state machine.
//!
//! ```text
//!  New ──connect──▶ Connecting ──open cb──▶ Open
//!   ▲                  │  │                  │
//!   │        error cb  │  │ close            │ close / error cb
//!   │                  ▼  ▼                  ▼
//!   └──── (connect) ─ Closed ◀──close cb── Closing
//! ```
//!
//! The state lives in a [`StateCell`], an atomic that every thread observes
//! consistently. Every transition that must not race (starting a connect,
//! starting a close, completing the handshake) is a compare-and-swap.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a client is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    New = 0,
    /// Handshake in progress.
    Connecting = 1,
    /// Connected; messages can be sent.
    Open = 2,
    /// Close requested, waiting for the engine to confirm.
    Closing = 3,
    /// Closed; may connect again.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// State name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of the engine's open callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Connecting became Open.
    Opened,
    /// A close was requested during the handshake; stay Closing.
    CloseRequested,
    /// The callback does not belong to a live handshake.
    Ignored(ConnectionState),
}

/// Outcome of a close request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseStart {
    /// The state moved from the given state to Closing; the caller must ask
    /// the engine to close.
    Started(ConnectionState),
    /// Another close is already in progress.
    AlreadyClosing,
    /// Nothing to close.
    AlreadyClosed,
    /// Never connected.
    NotConnected,
}

/// Atomic holder of a [`ConnectionState`].
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// A cell in the New state.
    pub const fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::New as u8))
    }

    /// Current state.
    #[inline]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Unconditionally set the state, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Move `from` to `to` if the state is still `from`. On failure returns
    /// the actual state.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// New or Closed to Connecting. On failure returns the actual state.
    pub fn begin_connect(&self) -> Result<ConnectionState, ConnectionState> {
        let mut current = self.get();
        loop {
            if !matches!(current, ConnectionState::New | ConnectionState::Closed) {
                return Err(current);
            }
            match self.transition(current, ConnectionState::Connecting) {
                Ok(()) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Apply the engine's open callback.
    pub fn on_open(&self) -> OpenOutcome {
        match self.transition(ConnectionState::Connecting, ConnectionState::Open) {
            Ok(()) => OpenOutcome::Opened,
            Err(ConnectionState::Closing) => OpenOutcome::CloseRequested,
            Err(other) => OpenOutcome::Ignored(other),
        }
    }

    /// Connecting or Open to Closing.
    pub fn begin_close(&self) -> CloseStart {
        let mut current = self.get();
        loop {
            match current {
                ConnectionState::New => return CloseStart::NotConnected,
                ConnectionState::Closed => return CloseStart::AlreadyClosed,
                ConnectionState::Closing => return CloseStart::AlreadyClosing,
                ConnectionState::Connecting | ConnectionState::Open => {
                    match self.transition(current, ConnectionState::Closing) {
                        Ok(()) => return CloseStart::Started(current),
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_happy_path() {
        let state = StateCell::new();
        assert_eq!(state.get(), ConnectionState::New);
        assert_eq!(state.begin_connect(), Ok(ConnectionState::New));
        assert_eq!(state.on_open(), OpenOutcome::Opened);
        assert_eq!(state.get(), ConnectionState::Open);
        assert_eq!(state.begin_close(), CloseStart::Started(ConnectionState::Open));
        assert_eq!(state.begin_close(), CloseStart::AlreadyClosing);
        state.set(ConnectionState::Closed);
        assert_eq!(state.begin_close(), CloseStart::AlreadyClosed);
        assert_eq!(state.begin_connect(), Ok(ConnectionState::Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        let state = StateCell::new();
        assert_eq!(state.begin_close(), CloseStart::NotConnected);
        assert_eq!(state.on_open(), OpenOutcome::Ignored(ConnectionState::New));

        state.begin_connect().unwrap();
        assert_eq!(state.begin_connect(), Err(ConnectionState::Connecting));
        state.on_open();
        assert_eq!(state.begin_connect(), Err(ConnectionState::Open));
    }

    #[test]
    fn test_close_during_handshake() {
        let state = StateCell::new();
        state.begin_connect().unwrap();
        assert_eq!(
            state.begin_close(),
            CloseStart::Started(ConnectionState::Connecting)
        );
        assert_eq!(state.on_open(), OpenOutcome::CloseRequested);
        assert_eq!(state.get(), ConnectionState::Closing);
    }

    #[test]
    fn test_concurrent_connect_has_one_winner() {
        let state = Arc::new(StateCell::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if state.begin_connect().is_ok() {
                        winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(state.get(), ConnectionState::Connecting);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Closing.to_string(), "Closing");
    }
}
