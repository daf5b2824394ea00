//! Core threading primitives for wsbridge.
//!
//! This crate provides the building blocks the `wsbridge` client is made of:
//!
//! - [`Signal`] - slot/signal observer used for user-facing events
//! - [`EventDispatcher`] - a single consumer thread delivering queued events
//!   in order
//! - [`PollWorker`] - a thread driving a [`Pollable`] engine until it stops
//! - [`thread_check`] - thread affinity and session-thread roles
//! - [`IdGenerator`] - diagnostic ids for clients, sessions and threads
//! - [`logging`] - `tracing` targets used across the workspace

pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod logging;
pub mod poller;
pub mod signal;
pub mod thread_check;

pub use dispatcher::{DispatcherConfig, EventDispatcher};
pub use error::DispatchError;
pub use ids::IdGenerator;
pub use poller::{ExitHandler, PollExit, PollWorker, Pollable, PollerConfig};
pub use signal::{ConnectionId, Signal};
pub use thread_check::{ThreadAffinity, ThreadRole};
