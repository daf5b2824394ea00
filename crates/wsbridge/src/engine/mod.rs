//! The protocol engine capability interface.
//!
//! A [`Client`](crate::Client) never speaks the wire protocol itself. It
//! drives an [`Engine`]: an external implementation that performs the
//! handshake, framing and TLS, and reports progress through five callback
//! slots. Engines make progress only when polled; every callback fires from
//! inside [`Pollable::poll`], on the client's poll thread.
//!
//! Engines are obtained from an [`EngineFactory`], which lets the caller pick
//! a platform binding at construction time. Any closure with the right
//! signature is a factory:
//!
//! ```
//! use std::sync::Arc;
//! use wsbridge::engine::{Engine, EngineFactory, LoopbackEngine};
//!
//! let factory = |_url: &url::Url, _protocols: &[String]| -> Result<Arc<dyn Engine>, String> {
//!     Ok(Arc::new(LoopbackEngine::new()))
//! };
//! let url = url::Url::parse("ws://localhost:9001").unwrap();
//! assert!(factory.create(&url, &[]).is_ok());
//! ```

mod loopback;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

pub use loopback::LoopbackEngine;
pub use wsbridge_core::Pollable;

/// Result code returned by engine operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineResult {
    /// The operation was accepted.
    Ok,
    /// The engine is not in a state that permits the operation.
    InvalidState,
    /// Any other failure.
    Unknown,
}

impl EngineResult {
    /// Map a raw engine status code: 0 is OK, 1 is invalid state, anything
    /// else is unknown.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::InvalidState,
            _ => Self::Unknown,
        }
    }

    /// The raw status code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidState => 1,
            Self::Unknown => -1,
        }
    }

    /// The result's name, as used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidState => "InvalidState",
            Self::Unknown => "Unknown",
        }
    }

    /// Check whether the operation was accepted.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for EngineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame kind of a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

impl Opcode {
    /// Map an RFC 6455 opcode number. Returns `None` for opcodes that never
    /// reach the message handler (continuation, close, reserved).
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode {
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// The RFC 6455 opcode number.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// Called when the handshake completes.
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;
/// Called when the connection has closed, with the close code and reason.
/// Engines that cannot report them pass 1005 and an empty reason.
pub type CloseHandler = Arc<dyn Fn(u16, &str) + Send + Sync>;
/// Called when the engine fails, with a description of the failure.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Called for every received data or ping frame.
pub type MessageHandler = Arc<dyn Fn(Bytes, Opcode) + Send + Sync>;
/// Called for every received pong frame.
pub type PongHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// An external protocol engine.
///
/// All methods take `&self`; implementations synchronize internally. No
/// callback may be invoked while the engine holds a lock that one of its
/// own methods needs, because callbacks are allowed to call back into the
/// engine (for example to close it).
pub trait Engine: Pollable {
    /// Begin connecting. Progress and the outcome are reported through the
    /// open/error callbacks during later polls.
    fn connect(&self) -> EngineResult;

    /// Begin the closing handshake.
    fn close(&self, code: u16, reason: &str) -> EngineResult;

    /// Send a text message.
    fn send_text(&self, text: &str) -> EngineResult;

    /// Send a binary message.
    fn send_binary(&self, data: &[u8]) -> EngineResult;

    /// Send a ping with the given payload.
    fn ping(&self, payload: &[u8]) -> EngineResult;

    /// Release the engine's resources. No callback fires afterwards.
    fn delete(&self);

    /// Install or clear the open callback.
    fn set_open_handler(&self, handler: Option<OpenHandler>);

    /// Install or clear the close callback.
    fn set_close_handler(&self, handler: Option<CloseHandler>);

    /// Install or clear the error callback.
    fn set_error_handler(&self, handler: Option<ErrorHandler>);

    /// Install or clear the message callback.
    fn set_message_handler(&self, handler: Option<MessageHandler>);

    /// Install or clear the pong callback.
    fn set_pong_handler(&self, handler: Option<PongHandler>);

    /// Clear all five callbacks.
    fn clear_handlers(&self) {
        self.set_open_handler(None);
        self.set_close_handler(None);
        self.set_error_handler(None);
        self.set_message_handler(None);
        self.set_pong_handler(None);
    }
}

/// Creates the engine for a client.
pub trait EngineFactory: Send + Sync {
    /// Build an engine for `url`, offering `protocols` as subprotocols.
    fn create(&self, url: &Url, protocols: &[String]) -> Result<Arc<dyn Engine>, String>;
}

impl<F> EngineFactory for F
where
    F: Fn(&Url, &[String]) -> Result<Arc<dyn Engine>, String> + Send + Sync,
{
    fn create(&self, url: &Url, protocols: &[String]) -> Result<Arc<dyn Engine>, String> {
        self(url, protocols)
    }
}
