//! State shared between a client handle, its engine callbacks and its
//! session threads.
//!
//! A session is one connect attempt. Each session gets a fresh poll thread
//! and, unless the previous one is still live, a fresh dispatcher. The
//! session number tags the engine callbacks installed for it, so late
//! callbacks from an earlier session are ignored.
//!
//! An ended session's dispatcher is parked in `retiring` until the next one
//! starts. The new dispatcher takes it over and delivers nothing until it has
//! exited, so handlers of consecutive sessions never overlap.
//!
//! Lock order: `transitions` before `worker` before `dispatcher` before
//! `retiring`. No lock is
//! held while calling into the engine, except `transitions`, which engine
//! callbacks never take.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};
use url::Url;
use wsbridge_core::logging::targets;
use wsbridge_core::thread_check::role_for;
use wsbridge_core::{
    DispatcherConfig, EventDispatcher, ExitHandler, PollWorker, Pollable, PollerConfig, Signal,
};

use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::event::{CloseEvent, ErrorEvent, Event, MessageEvent};
use crate::ping::{PingCorrelator, PingOutcome};
use crate::state::{CloseStart, ConnectionState, StateCell};

/// The user-facing signals of a client.
#[derive(Default)]
pub(crate) struct Signals {
    pub(crate) open: Signal<()>,
    pub(crate) close: Signal<CloseEvent>,
    pub(crate) error: Signal<ErrorEvent>,
    pub(crate) message: Signal<MessageEvent>,
}

impl Signals {
    /// Runs on the dispatcher thread.
    fn deliver(&self, event: Event) {
        match event {
            Event::Open => {
                self.open.emit(());
            }
            Event::Close(close) => {
                self.close.emit(close);
            }
            Event::Error(error) => {
                self.error.emit(error);
            }
            Event::Message(message) => {
                self.message.emit(message);
            }
        }
    }

    fn disconnect_all(&self) {
        self.open.disconnect_all();
        self.close.disconnect_all();
        self.error.disconnect_all();
        self.message.disconnect_all();
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) url: Url,
    pub(crate) protocols: Vec<String>,
    pub(crate) config: ClientConfig,
    engine: RwLock<Option<Arc<dyn Engine>>>,
    pub(crate) state: StateCell,
    transitions: Mutex<()>,
    worker: Mutex<Option<PollWorker>>,
    dispatcher: Mutex<Option<Arc<EventDispatcher<Event>>>>,
    retiring: Mutex<Option<Arc<EventDispatcher<Event>>>>,
    pub(crate) pings: PingCorrelator,
    pub(crate) last_error: Mutex<Option<String>>,
    disposed: AtomicBool,
    session: AtomicU64,
    pub(crate) signals: Arc<Signals>,
}

impl Shared {
    pub(crate) fn new(
        id: u64,
        url: Url,
        protocols: Vec<String>,
        config: ClientConfig,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            id,
            url,
            protocols,
            config,
            engine: RwLock::new(Some(engine)),
            state: StateCell::new(),
            transitions: Mutex::new(()),
            worker: Mutex::new(None),
            dispatcher: Mutex::new(None),
            retiring: Mutex::new(None),
            pings: PingCorrelator::new(),
            last_error: Mutex::new(None),
            disposed: AtomicBool::new(false),
            session: AtomicU64::new(0),
            signals: Arc::new(Signals::default()),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn current_session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// The engine, or `Disposed`.
    pub(crate) fn engine(&self) -> Result<Arc<dyn Engine>> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.engine.read().clone().ok_or(Error::Disposed)
    }

    /// Blocking operations would wait on work only a session thread can do.
    pub(crate) fn ensure_not_session_thread(&self, operation: &str) -> Result<()> {
        match role_for(self.id) {
            Some(role) => Err(Error::InvalidState(format!(
                "{operation} would block the client's {role} thread"
            ))),
            None => Ok(()),
        }
    }

    fn worker_alive(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(PollWorker::is_alive)
    }

    /// Queue an event on the live session's dispatcher.
    pub(crate) fn enqueue(&self, event: Event) {
        let dispatcher = self.dispatcher.lock().clone();
        match dispatcher {
            Some(dispatcher) => {
                let kind = event.kind();
                if dispatcher.enqueue(event).is_err() {
                    tracing::debug!(target: targets::CLIENT, client = self.id, kind, "dispatcher stopped, event dropped");
                }
            }
            None => {
                tracing::debug!(target: targets::CLIENT, client = self.id, kind = event.kind(), "no live session, event dropped");
            }
        }
    }

    /// End the live session: the state becomes Closed, pending pings are
    /// released, and the session's dispatcher delivers `event` as its last
    /// event before exiting (or stops at once when there is none).
    ///
    /// The state change and the dispatcher hand-off happen under the
    /// dispatcher lock, so a connect that observes Closed always gets a new
    /// dispatcher, started behind the one retired here.
    pub(crate) fn end_session(&self, event: Option<Event>) {
        let (previous, dispatcher, stale) = {
            let mut slot = self.dispatcher.lock();
            let previous = self.state.set(ConnectionState::Closed);
            let dispatcher = slot.take();
            let stale = dispatcher
                .as_ref()
                .and_then(|dispatcher| self.retiring.lock().replace(dispatcher.clone()));
            (previous, dispatcher, stale)
        };
        self.pings.abandon_all();
        if let Some(stale) = stale {
            stale.retire();
        }

        match (dispatcher, event) {
            (Some(dispatcher), Some(event)) => {
                tracing::debug!(target: targets::CLIENT, client = self.id, %previous, last = event.kind(), "session ended");
                if dispatcher.finish_with(event).is_err() {
                    tracing::debug!(target: targets::CLIENT, client = self.id, "dispatcher already stopped");
                }
            }
            (Some(dispatcher), None) => {
                tracing::debug!(target: targets::CLIENT, client = self.id, %previous, "session ended without event");
                dispatcher.shutdown();
            }
            (None, Some(event)) => {
                tracing::warn!(target: targets::CLIENT, client = self.id, kind = event.kind(), "duplicate close event");
            }
            (None, None) => {}
        }
    }

    fn ensure_dispatcher(&self, session: u64) -> Result<()> {
        let mut slot = self.dispatcher.lock();
        if slot.is_none() {
            let signals = self.signals.clone();
            let config = DispatcherConfig::with_name(format!(
                "{}-dispatch-{}.{}",
                self.config.thread_prefix, self.id, session
            ))
            .owner(self.id)
            .idle_wait(self.config.dispatch_idle);
            let predecessor = self.retiring.lock().take();
            let dispatcher =
                EventDispatcher::start_after(config, predecessor, move |event: Event| signals.deliver(event))?;
            *slot = Some(Arc::new(dispatcher));
        }
        Ok(())
    }

    /// Start a new session: New/Closed to Connecting, fresh threads, engine
    /// connect. Returns the session number.
    pub(crate) fn start_session(self: &Arc<Self>) -> Result<u64> {
        let engine = self.engine()?;
        let _transition = self.transitions.lock();

        let previous = self
            .state
            .begin_connect()
            .map_err(|state| Error::InvalidState(format!("cannot connect while {state}")))?;
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target: targets::CLIENT, client = self.id, session, %previous, url = %self.url, "connecting");

        // Never reuse a poll thread.
        let old_worker = self.worker.lock().take();
        if let Some(old_worker) = old_worker {
            old_worker.dispose();
        }
        *self.last_error.lock() = None;

        if let Err(err) = self.ensure_dispatcher(session) {
            self.state.set(ConnectionState::Closed);
            return Err(err);
        }
        self.install_handlers(&engine, session);

        let result = engine.connect();
        if !result.is_ok() {
            tracing::warn!(target: targets::CLIENT, client = self.id, session, %result, "engine rejected connect");
            *self.last_error.lock() = Some(format!("engine returned {result}"));
            self.end_session(None);
            return Err(Error::ConnectFailure(format!("Connect failed: engine returned {result}")));
        }

        let config = PollerConfig::with_name(format!(
            "{}-poll-{}.{}",
            self.config.thread_prefix, self.id, session
        ))
        .owner(self.id)
        .interval(self.config.poll_interval)
        .grace_iterations(self.config.close_grace_iterations);

        let weak = Arc::downgrade(self);
        let on_exit: ExitHandler = Box::new(move |exit| {
            if let Some(shared) = Shared::live(&weak, session) {
                shared.handle_poll_exit(exit);
            }
        });
        let target: Arc<dyn Pollable> = engine.clone();

        match PollWorker::start(config, target, Some(on_exit)) {
            Ok(worker) => {
                *self.worker.lock() = Some(worker);
                if self.is_disposed() {
                    // dispose ran before the worker was stored
                    let worker = self.worker.lock().take();
                    if let Some(worker) = worker {
                        worker.dispose();
                    }
                    return Err(Error::Disposed);
                }
                Ok(session)
            }
            Err(err) => {
                let _ = engine.close(1001, "Going away");
                self.end_session(None);
                Err(Error::Spawn(err))
            }
        }
    }

    /// Block until the session started as `session` opens or fails.
    pub(crate) fn wait_open(&self, session: u64) -> Result<()> {
        loop {
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            match self.state.get() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting if self.current_session() == session => {
                    thread::sleep(self.config.wait_interval);
                }
                _ => break,
            }
        }

        let reason = self
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed before it opened".to_string());
        Err(Error::ConnectFailure(format!("Connect failed: {reason}")))
    }

    /// Request a close. With `blocking`, wait until Closed.
    pub(crate) fn close(&self, code: u16, reason: &str, blocking: bool) -> Result<()> {
        let engine = self.engine()?;
        if blocking {
            self.ensure_not_session_thread("close")?;
        }

        match self.state.begin_close() {
            CloseStart::NotConnected => {
                return Err(Error::InvalidState("cannot close a client that never connected".into()));
            }
            CloseStart::AlreadyClosed => return Ok(()),
            CloseStart::AlreadyClosing => {}
            CloseStart::Started(previous) => {
                tracing::debug!(target: targets::CLIENT, client = self.id, %previous, code, reason, "closing");
                let result = engine.close(code, reason);
                if !result.is_ok() {
                    tracing::warn!(target: targets::CLIENT, client = self.id, %result, "engine refused close, forcing Closed");
                    let event = ErrorEvent::with_cause(
                        format!("Close failed: engine returned {result}"),
                        Error::SendFailure { result },
                    );
                    self.end_session(Some(Event::Error(event)));
                    return Err(Error::SendFailure { result });
                }
            }
        }

        if blocking {
            self.wait_closed();
        }
        Ok(())
    }

    fn wait_closed(&self) {
        while self.state.get() != ConnectionState::Closed && !self.is_disposed() {
            if !self.worker_alive() {
                // A connect may still be setting up its poll thread.
                let _transition = self.transitions.lock();
                if self.state.get() != ConnectionState::Closed && !self.worker_alive() {
                    tracing::debug!(target: targets::CLIENT, client = self.id, "poll thread gone, forcing Closed");
                    self.end_session(Some(Event::Close(CloseEvent::new(
                        1006,
                        "engine stopped without closing",
                    ))));
                }
                return;
            }
            thread::sleep(self.config.wait_interval);
        }
    }

    /// Send a liveness probe and wait for its pong.
    pub(crate) fn ping_blocking(&self, payload: &[u8], timeout: std::time::Duration) -> Result<()> {
        let engine = self.engine()?;
        self.ensure_not_session_thread("ping_blocking")?;

        let ticket = self.pings.register(payload.to_vec());
        let result = engine.ping(payload);
        if !result.is_ok() {
            self.pings.cancel(&ticket);
            return Err(Error::SendFailure { result });
        }

        match self.pings.wait(&ticket, timeout, self.config.wait_interval) {
            PingOutcome::Answered => Ok(()),
            PingOutcome::Abandoned | PingOutcome::TimedOut => {
                tracing::debug!(target: targets::PING, client = self.id, "probe unanswered");
                Err(Error::Timeout)
            }
        }
    }

    /// Release everything, once. See [`Client::dispose`](crate::Client::dispose).
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: targets::CLIENT, client = self.id, state = %self.state.get(), "disposing");

        let engine = self.engine.read().clone();

        if let Some(engine) = &engine {
            engine.clear_handlers();
            if let CloseStart::Started(previous) = self.state.begin_close() {
                let result = engine.close(1001, "Going away");
                tracing::debug!(target: targets::CLIENT, client = self.id, %previous, %result, "close on dispose");
            }
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.dispose();
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown();
        }
        let retiring = self.retiring.lock().take();
        if let Some(retiring) = retiring {
            retiring.shutdown();
        }

        self.pings.abandon_all();
        self.state.set(ConnectionState::Closed);
        self.signals.disconnect_all();

        drop(engine);
        let engine = self.engine.write().take();
        if let Some(engine) = engine {
            engine.delete();
        }
        tracing::debug!(target: targets::CLIENT, client = self.id, "disposed");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.get_mut().take() {
            tracing::warn!(target: targets::CLIENT, client = self.id, "client state dropped without dispose, releasing engine");
            engine.clear_handlers();
            engine.delete();
        }
    }
}
