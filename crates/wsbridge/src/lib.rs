//! Thread-safe, event-driven WebSocket client over a polled protocol engine.
//!
//! `wsbridge` turns an engine that only makes progress when polled, and
//! reports through raw callbacks, into a [`Client`] that:
//!
//! - blocks on `connect`/`close` until the state settles, or returns at once
//!   from the `*_async` variants,
//! - delivers open, close, error and message events in order on a dedicated
//!   dispatcher thread through [`Signal`]s,
//! - correlates liveness pings with their pongs,
//! - tears everything down in a fixed order exactly once.
//!
//! The engine itself is pluggable through [`engine::EngineFactory`]; the
//! in-process [`engine::LoopbackEngine`] serves tests and examples.
//!
//! Logging goes through `tracing` under the targets in
//! [`wsbridge_core::logging::targets`].

mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
mod handlers;
pub mod ping;
mod shared;
pub mod state;

pub use client::{Client, ClientBuilder, Completion, DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_REASON};
pub use config::ClientConfig;
pub use engine::{Engine, EngineFactory, EngineResult, Opcode};
pub use error::{Error, Result};
pub use event::{CloseCode, CloseEvent, ErrorEvent, Event, MessageEvent};
pub use state::ConnectionState;
pub use wsbridge_core::{ConnectionId, IdGenerator, Signal};
