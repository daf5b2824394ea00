//! Error types for wsbridge-core.

use std::fmt;

/// Errors raised by the event dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// `dispose` was called from the dispatcher's own thread, which would
    /// have to join itself.
    SelfDispose,
    /// The dispatcher has stopped and no longer accepts events.
    Stopped,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfDispose => {
                write!(f, "Dispatcher cannot be disposed from its own thread")
            }
            Self::Stopped => write!(f, "Dispatcher has stopped"),
        }
    }
}

impl std::error::Error for DispatchError {}
