//! The WebSocket client facade.
//!
//! A [`Client`] wraps one engine for its whole life. Each connect starts a
//! session with two threads: a poll thread that drives the engine and turns
//! its callbacks into state changes and queued events, and a dispatcher
//! thread that delivers those events to the client's signals, one at a time
//! and in order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use wsbridge::Client;
//! use wsbridge::engine::LoopbackEngine;
//!
//! let engine = Arc::new(LoopbackEngine::new());
//! let client = Client::new("ws://localhost:9001/feed", &engine.factory()).unwrap();
//!
//! client.on_message().connect(|message| {
//!     println!("received {}", message.text());
//! });
//!
//! client.connect().unwrap();
//! client.send_text("hello").unwrap();
//! client.close().unwrap();
//! client.dispose();
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use url::Url;
use wsbridge_core::logging::targets;
use wsbridge_core::thread_check::role_for;
use wsbridge_core::{IdGenerator, Signal, ThreadRole};

use crate::config::ClientConfig;
use crate::engine::EngineFactory;
use crate::error::{Error, Result};
use crate::event::{CloseEvent, ErrorEvent, MessageEvent};
use crate::shared::Shared;
use crate::state::ConnectionState;

/// Default close code: going away.
pub const DEFAULT_CLOSE_CODE: u16 = 1001;

/// Default close reason.
pub const DEFAULT_CLOSE_REASON: &str = "Going away";

/// Size of the random payload of an `is_alive` probe.
const PROBE_LEN: usize = 16;

/// Completion callback of the `*_async` send operations.
pub type Completion = Box<dyn FnOnce(bool) + Send + 'static>;

/// A thread-safe, event-driven WebSocket client.
///
/// All methods take `&self` and may be called from any thread. Blocking
/// methods (`connect`, `close`, `ping_blocking`, `is_alive`) refuse to run on
/// the client's own dispatcher or poll thread, since they would wait for work
/// that thread has to do; call the `*_async` variants from event handlers.
///
/// Dropping the client disposes it.
pub struct Client {
    shared: Arc<Shared>,
}

static_assertions::assert_impl_all!(Client: Send, Sync);

impl Client {
    /// Create a client for `address` with no subprotocols.
    pub fn new(address: &str, factory: &dyn EngineFactory) -> Result<Self> {
        Self::builder(address).build(factory)
    }

    /// Create a client for `address` offering `protocols`.
    pub fn with_protocols<I, S>(address: &str, protocols: I, factory: &dyn EngineFactory) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder(address).protocols(protocols).build(factory)
    }

    /// Start building a client.
    pub fn builder(address: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Connect and block until the connection is open.
    ///
    /// Fails with `ConnectFailure` when the engine refuses or the handshake
    /// fails, carrying the engine's last error text, and with `InvalidState`
    /// when the client is already connecting or connected.
    pub fn connect(&self) -> Result<()> {
        self.shared.ensure_not_session_thread("connect")?;
        let session = self.shared.start_session()?;
        self.shared.wait_open(session)
    }

    /// Start connecting without waiting. The outcome arrives as an open,
    /// error or close event.
    pub fn connect_async(&self) -> Result<()> {
        if role_for(self.shared.id) == Some(ThreadRole::Poller) {
            return Err(Error::InvalidState(
                "connect_async would join the client's poll thread".into(),
            ));
        }
        self.shared.start_session().map(|_| ())
    }

    /// Close with code 1001 and block until closed.
    ///
    /// If the engine refuses, the client is closed anyway, an error event is
    /// delivered and this returns `SendFailure`.
    pub fn close(&self) -> Result<()> {
        self.shared.close(DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_REASON, true)
    }

    /// Close with `code` and block until closed.
    pub fn close_with(&self, code: u16) -> Result<()> {
        self.shared.close(code, DEFAULT_CLOSE_REASON, true)
    }

    /// Close with `code` and `reason` and block until closed.
    pub fn close_with_reason(&self, code: u16, reason: &str) -> Result<()> {
        self.shared.close(code, reason, true)
    }

    /// Start closing with code 1001.
    pub fn close_async(&self) -> Result<()> {
        self.shared.close(DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_REASON, false)
    }

    /// Start closing with `code`.
    pub fn close_async_with(&self, code: u16) -> Result<()> {
        self.shared.close(code, DEFAULT_CLOSE_REASON, false)
    }

    /// Start closing with `code` and `reason`.
    pub fn close_async_with_reason(&self, code: u16, reason: &str) -> Result<()> {
        self.shared.close(code, reason, false)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send a text message.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let result = self.shared.engine()?.send_text(text);
        if result.is_ok() {
            Ok(())
        } else {
            tracing::debug!(target: targets::CLIENT, client = self.shared.id, %result, "send_text refused");
            Err(Error::SendFailure { result })
        }
    }

    /// Send a binary message.
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        let result = self.shared.engine()?.send_binary(data);
        if result.is_ok() {
            Ok(())
        } else {
            tracing::debug!(target: targets::CLIENT, client = self.shared.id, %result, "send_binary refused");
            Err(Error::SendFailure { result })
        }
    }

    /// Send a ping without waiting for its pong. The pong arrives as a
    /// message event of kind pong.
    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        let result = self.shared.engine()?.ping(payload);
        if result.is_ok() {
            Ok(())
        } else {
            tracing::debug!(target: targets::CLIENT, client = self.shared.id, %result, "ping refused");
            Err(Error::SendFailure { result })
        }
    }

    /// Send a text message, then call `on_complete` with `true`.
    ///
    /// The send itself is synchronous. On failure the error is returned and
    /// `on_complete` is not called.
    pub fn send_text_async(&self, text: &str, on_complete: Option<Completion>) -> Result<()> {
        self.send_text(text)?;
        complete(on_complete);
        Ok(())
    }

    /// Send a binary message, then call `on_complete` with `true`.
    /// Same contract as [`send_text_async`](Self::send_text_async).
    pub fn send_binary_async(&self, data: &[u8], on_complete: Option<Completion>) -> Result<()> {
        self.send_binary(data)?;
        complete(on_complete);
        Ok(())
    }

    /// Send a ping, then call `on_complete` with `true`.
    pub fn ping_async(&self, payload: &[u8], on_complete: Option<Completion>) -> Result<()> {
        self.ping(payload)?;
        complete(on_complete);
        Ok(())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Ping and block until the matching pong arrives, using the configured
    /// timeout. Fails with `Timeout` if it does not arrive in time or the
    /// connection goes down first.
    pub fn ping_blocking(&self, payload: &[u8]) -> Result<()> {
        self.shared.ping_blocking(payload, self.shared.config.ping_timeout)
    }

    /// [`ping_blocking`](Self::ping_blocking) with an explicit timeout.
    pub fn ping_blocking_timeout(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        self.shared.ping_blocking(payload, timeout)
    }

    /// Check whether the connection is open and answering.
    ///
    /// A pong seen within the debounce window counts as an answer; otherwise
    /// this sends a random probe and waits for it. Never fails.
    pub fn is_alive(&self) -> bool {
        if self.shared.is_disposed() || self.ready_state() != ConnectionState::Open {
            return false;
        }
        if self.shared.pings.answered_within(self.shared.config.alive_debounce) {
            return true;
        }

        let mut probe = [0u8; PROBE_LEN];
        rand::thread_rng().fill(&mut probe[..]);

        match self.ping_blocking(&probe) {
            Ok(()) => true,
            Err(Error::Timeout) => false,
            Err(err @ Error::InvalidState(_)) => {
                tracing::warn!(target: targets::PING, client = self.shared.id, error = %err, "cannot probe from a session thread, assuming alive");
                true
            }
            Err(err) => {
                tracing::warn!(target: targets::PING, client = self.shared.id, error = %err, "liveness probe failed");
                false
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current connection state.
    pub fn ready_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Check whether the address uses `wss`.
    pub fn is_secure(&self) -> bool {
        self.shared.url.scheme() == "wss"
    }

    /// The parsed address.
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// The offered subprotocols.
    pub fn protocols(&self) -> &[String] {
        &self.shared.protocols
    }

    /// Diagnostic id, unique per id generator.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// The last error text reported by the engine in the current session.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Check whether the client has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Emitted when the connection opens.
    pub fn on_open(&self) -> &Signal<()> {
        &self.shared.signals.open
    }

    /// Emitted once per session when the connection has closed.
    pub fn on_close(&self) -> &Signal<CloseEvent> {
        &self.shared.signals.close
    }

    /// Emitted on engine errors and failed connects.
    pub fn on_error(&self) -> &Signal<ErrorEvent> {
        &self.shared.signals.error
    }

    /// Emitted for every received message, including unsolicited pongs.
    pub fn on_message(&self) -> &Signal<MessageEvent> {
        &self.shared.signals.message
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Release the connection, its threads and the engine.
    ///
    /// Idempotent and callable from any thread, including an event handler.
    /// Queued events that have not been delivered are discarded, and all
    /// signal connections are dropped.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

fn complete(on_complete: Option<Completion>) {
    if let Some(on_complete) = on_complete {
        on_complete(true);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url.as_str())
            .field("protocols", &self.shared.protocols)
            .field("state", &self.ready_state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    address: String,
    protocols: Vec<String>,
    config: ClientConfig,
    ids: Option<Arc<IdGenerator>>,
}

impl ClientBuilder {
    fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocols: Vec::new(),
            config: ClientConfig::default(),
            ids: None,
        }
    }

    /// Offer these subprotocols.
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Use this configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Draw the client id from `ids` instead of the process-wide generator.
    pub fn id_generator(mut self, ids: Arc<IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validate the address and configuration and create the engine.
    pub fn build(self, factory: &dyn EngineFactory) -> Result<Client> {
        let url = Url::parse(&self.address)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.address)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidUrl(format!(
                "{}: scheme must be ws or wss, got {}",
                self.address,
                url.scheme()
            )));
        }
        self.config.validate()?;

        let engine = factory
            .create(&url, &self.protocols)
            .map_err(Error::EngineUnavailable)?;
        let ids = self.ids.unwrap_or_else(IdGenerator::shared);
        let id = ids.next_id();

        tracing::debug!(target: targets::CLIENT, client = id, url = %url, protocols = ?self.protocols, "client created");

        Ok(Client {
            shared: Arc::new(Shared::new(id, url, self.protocols, self.config, engine)),
        })
    }
}
