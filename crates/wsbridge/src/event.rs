//! Events delivered to client slots.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::engine::Opcode;
use crate::error::Error;

/// Standard WebSocket close codes as defined in RFC 6455.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CloseCode {
    /// Normal closure; the connection successfully completed.
    #[default]
    Normal,
    /// Endpoint is going away (e.g., client shutting down).
    Away,
    /// Protocol error occurred.
    Protocol,
    /// Received data type that cannot be accepted.
    Unsupported,
    /// No status code was provided.
    NoStatus,
    /// Connection was closed abnormally (no close frame received).
    Abnormal,
    /// Received data that was not consistent with the message type.
    Invalid,
    /// Policy violation.
    Policy,
    /// Message too big to process.
    TooBig,
    /// Extension negotiation failed.
    Extension,
    /// Unexpected condition prevented the request from being fulfilled.
    Error,
    /// Server is restarting.
    Restart,
    /// Server is too busy; try again later.
    Again,
    /// Any other code, including application codes in 4000-4999.
    Custom(u16),
}

impl CloseCode {
    /// Convert to the numeric close code.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Away => 1001,
            Self::Protocol => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::Invalid => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::Extension => 1010,
            Self::Error => 1011,
            Self::Restart => 1012,
            Self::Again => 1013,
            Self::Custom(code) => *code,
        }
    }

    /// Create from a numeric close code.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            code => Self::Custom(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

/// The connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    /// The close status code.
    pub code: u16,
    /// Human-readable reason; may be empty.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The close code as a [`CloseCode`].
    pub fn close_code(&self) -> CloseCode {
        CloseCode::from_u16(self.code)
    }

    /// `true` when the peer sent a proper close status.
    pub fn was_clean(&self) -> bool {
        self.code >= 1000 && self.code != 1005
    }
}

/// Something went wrong in the engine or while driving it.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    /// Description of the failure.
    pub message: String,
    /// The underlying error, when the failure was detected locally.
    pub cause: Option<Arc<Error>>,
}

impl ErrorEvent {
    /// Create an error event without a cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Create an error event carrying a locally detected error.
    pub fn with_cause(message: impl Into<String>, cause: Error) -> Self {
        Self {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A received frame.
///
/// The text view is decoded on first use (invalid UTF-8 is replaced) and
/// cached.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    data: Bytes,
    opcode: Opcode,
    text: OnceLock<String>,
}

impl MessageEvent {
    /// Create a message event.
    pub fn new(data: Bytes, opcode: Opcode) -> Self {
        Self {
            data,
            opcode,
            text: OnceLock::new(),
        }
    }

    /// The frame kind.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// `true` for text frames.
    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }

    /// `true` for binary frames.
    pub fn is_binary(&self) -> bool {
        self.opcode == Opcode::Binary
    }

    /// `true` for ping frames.
    pub fn is_ping(&self) -> bool {
        self.opcode == Opcode::Ping
    }

    /// `true` for pong frames not matched by a liveness probe.
    pub fn is_pong(&self) -> bool {
        self.opcode == Opcode::Pong
    }

    /// The raw payload.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// The payload as a cheaply cloneable buffer.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// The payload decoded as UTF-8.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.data).into_owned())
    }
}

/// Everything a client reports to its slots, in delivery order.
#[derive(Clone, Debug)]
pub enum Event {
    /// The handshake completed.
    Open,
    /// The connection closed.
    Close(CloseEvent),
    /// The engine reported an error, or one was detected locally.
    Error(ErrorEvent),
    /// A frame arrived.
    Message(MessageEvent),
}

impl Event {
    /// Short name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close(_) => "close",
            Self::Error(_) => "error",
            Self::Message(_) => "message",
        }
    }
}
