//! Error types for the wsbridge client.

use crate::engine::EngineResult;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using a [`Client`](crate::Client).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection could not be established.
    #[error("{0}")]
    ConnectFailure(String),

    /// The engine rejected a send or ping.
    #[error("Send failed: {}", result.name())]
    SendFailure {
        /// The engine's result code.
        result: EngineResult,
    },

    /// A liveness probe was not answered in time, or the connection was torn
    /// down while it was waiting.
    #[error("Ping timed out")]
    Timeout,

    /// The operation is not valid in the current state, or may not be
    /// called from this thread.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The client has been disposed.
    #[error("Client has been disposed")]
    Disposed,

    /// The address is not a usable `ws://` or `wss://` URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The engine factory could not provide an engine.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A session thread could not be spawned.
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
