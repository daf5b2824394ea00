//! Client configuration.
//!
//! [`ClientConfig`] carries the timing knobs of a client. It can be built in
//! code with builder-style setters or loaded from TOML, where durations are
//! given in milliseconds and every key is optional:
//!
//! ```toml
//! ping_timeout_ms = 5000
//! alive_debounce_ms = 300
//! close_grace_iterations = 500
//! thread_prefix = "feed"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Timing and naming configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// How long a blocking ping waits for its pong.
    #[serde(rename = "ping_timeout_ms", deserialize_with = "millis")]
    pub ping_timeout: Duration,
    /// A pong seen within this window makes `is_alive` skip its probe.
    #[serde(rename = "alive_debounce_ms", deserialize_with = "millis")]
    pub alive_debounce: Duration,
    /// Granularity of the blocking waits in connect, close and ping.
    #[serde(rename = "wait_interval_ms", deserialize_with = "millis")]
    pub wait_interval: Duration,
    /// Pause between engine polls.
    #[serde(rename = "poll_interval_ms", deserialize_with = "millis")]
    pub poll_interval: Duration,
    /// Maximum polls spent waiting for a closing handshake after the poll
    /// thread is told to stop.
    pub close_grace_iterations: u32,
    /// How long the dispatcher waits on an empty queue before re-checking
    /// whether it should stop.
    #[serde(rename = "dispatch_idle_ms", deserialize_with = "millis")]
    pub dispatch_idle: Duration,
    /// Prefix of session thread names.
    pub thread_prefix: String,
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_millis(15_000),
            alive_debounce: Duration::from_millis(300),
            wait_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            close_grace_iterations: 1000,
            dispatch_idle: Duration::from_millis(1),
            thread_prefix: "wsbridge".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Check the values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.thread_prefix.is_empty() {
            return Err(Error::Config("thread_prefix must not be empty".into()));
        }
        if self.thread_prefix.contains('\0') {
            return Err(Error::Config("thread_prefix must not contain NUL".into()));
        }
        Ok(())
    }

    /// Set the blocking ping timeout.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the `is_alive` debounce window.
    pub fn alive_debounce(mut self, window: Duration) -> Self {
        self.alive_debounce = window;
        self
    }

    /// Set the blocking wait granularity.
    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Set the pause between engine polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of grace polls for a closing handshake.
    pub fn close_grace_iterations(mut self, iterations: u32) -> Self {
        self.close_grace_iterations = iterations;
        self
    }

    /// Set the dispatcher's idle wait.
    pub fn dispatch_idle(mut self, idle: Duration) -> Self {
        self.dispatch_idle = idle;
        self
    }

    /// Set the session thread name prefix.
    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }
}
