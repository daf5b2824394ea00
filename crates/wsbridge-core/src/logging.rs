//! Logging facilities for wsbridge.
//!
//! wsbridge uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("wsbridge=debug,wsbridge_core=debug")
//!         .init();
//!
//!     // Your application code...
//! }
//! ```
//!
//! Every lifecycle message carries a `client` field (and `session` where one
//! applies) so the output of several clients in one process can be told apart.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "wsbridge_core";
    /// Event dispatcher thread target.
    pub const DISPATCHER: &str = "wsbridge_core::dispatcher";
    /// Engine poll thread target.
    pub const POLLER: &str = "wsbridge_core::poller";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "wsbridge_core::signal";
    /// Client facade target.
    pub const CLIENT: &str = "wsbridge::client";
    /// Engine callbacks and engine lifecycle target.
    pub const ENGINE: &str = "wsbridge::engine";
    /// Liveness probe target.
    pub const PING: &str = "wsbridge::ping";
}

/// Render a caught panic payload as text for log output.
///
/// Panics raised with `panic!("literal")` carry a `&str`, formatted ones a
/// `String`; anything else is reported as opaque.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
