//! Engine callbacks of a session.
//!
//! These run on the poll thread, inside the engine's `poll`. They update the
//! connection state and queue events for the dispatcher; user code never
//! runs here.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use wsbridge_core::PollExit;
use wsbridge_core::logging::targets;

use crate::engine::{
    CloseHandler, Engine, ErrorHandler, MessageHandler, OpenHandler, Opcode, PongHandler,
};
use crate::event::{CloseEvent, ErrorEvent, Event, MessageEvent};
use crate::shared::Shared;
use crate::state::{CloseStart, ConnectionState, OpenOutcome};

impl Shared {
    /// The client behind `weak`, if it is alive, not disposed and still on
    /// `session`.
    pub(crate) fn live(weak: &Weak<Shared>, session: u64) -> Option<Arc<Shared>> {
        let shared = weak.upgrade()?;
        if shared.is_disposed() {
            return None;
        }
        if shared.current_session() != session {
            tracing::trace!(target: targets::ENGINE, client = shared.id, session, "stale callback ignored");
            return None;
        }
        Some(shared)
    }

    /// Install the five engine callbacks for `session`.
    pub(crate) fn install_handlers(self: &Arc<Self>, engine: &Arc<dyn Engine>, session: u64) {
        let weak = Arc::downgrade(self);

        let on_open: OpenHandler = {
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(shared) = Shared::live(&weak, session) {
                    shared.handle_open();
                }
            })
        };
        let on_close: CloseHandler = {
            let weak = weak.clone();
            Arc::new(move |code: u16, reason: &str| {
                if let Some(shared) = Shared::live(&weak, session) {
                    shared.handle_close(code, reason);
                }
            })
        };
        let on_error: ErrorHandler = {
            let weak = weak.clone();
            Arc::new(move |message: &str| {
                if let Some(shared) = Shared::live(&weak, session) {
                    shared.handle_error(message);
                }
            })
        };
        let on_message: MessageHandler = {
            let weak = weak.clone();
            Arc::new(move |data: Bytes, opcode: Opcode| {
                if let Some(shared) = Shared::live(&weak, session) {
                    shared.enqueue(Event::Message(MessageEvent::new(data, opcode)));
                }
            })
        };
        let on_pong: PongHandler = Arc::new(move |data: Bytes| {
            if let Some(shared) = Shared::live(&weak, session) {
                shared.handle_pong(data);
            }
        });

        engine.set_open_handler(Some(on_open));
        engine.set_close_handler(Some(on_close));
        engine.set_error_handler(Some(on_error));
        engine.set_message_handler(Some(on_message));
        engine.set_pong_handler(Some(on_pong));
    }

    fn handle_open(&self) {
        match self.state.on_open() {
            OpenOutcome::Opened => {
                tracing::debug!(target: targets::CLIENT, client = self.id, "open");
                self.enqueue(Event::Open);
            }
            OpenOutcome::CloseRequested => {
                tracing::debug!(target: targets::CLIENT, client = self.id, "opened after close was requested");
                if let Ok(engine) = self.engine() {
                    let result = engine.close(1001, "Going away");
                    if !result.is_ok() {
                        tracing::debug!(target: targets::CLIENT, client = self.id, %result, "close after open refused");
                    }
                }
            }
            OpenOutcome::Ignored(state) => {
                tracing::debug!(target: targets::CLIENT, client = self.id, %state, "open ignored");
            }
        }
    }

    fn handle_close(&self, code: u16, reason: &str) {
        tracing::debug!(target: targets::CLIENT, client = self.id, code, reason, "closed");
        self.end_session(Some(Event::Close(CloseEvent::new(code, reason))));
    }

    fn handle_error(&self, message: &str) {
        tracing::debug!(target: targets::CLIENT, client = self.id, state = %self.state.get(), message, "engine error");
        *self.last_error.lock() = Some(message.to_string());

        match self.state.get() {
            ConnectionState::Connecting => {
                let event = ErrorEvent::new(format!("Connect error: {message}"));
                self.end_session(Some(Event::Error(event)));
            }
            ConnectionState::Open => {
                let event = Event::Error(ErrorEvent::new(message));
                let closing = match (self.state.begin_close(), self.engine()) {
                    (CloseStart::Started(_), Ok(engine)) => engine.close(1001, "Going away").is_ok(),
                    (CloseStart::AlreadyClosing, _) => true,
                    _ => false,
                };
                if closing {
                    self.pings.abandon_all();
                    self.enqueue(event);
                } else {
                    self.end_session(Some(event));
                }
            }
            _ => {
                self.pings.abandon_all();
                self.enqueue(Event::Error(ErrorEvent::new(message)));
            }
        }
    }

    fn handle_pong(&self, data: Bytes) {
        if !self.pings.match_pong(&data) {
            self.enqueue(Event::Message(MessageEvent::new(data, Opcode::Pong)));
        }
    }

    /// The session's poll thread has exited.
    pub(crate) fn handle_poll_exit(&self, exit: PollExit) {
        match exit {
            PollExit::Panicked(message) => {
                tracing::error!(target: targets::CLIENT, client = self.id, panic = %message, "engine poll failed");
                *self.last_error.lock() = Some(format!("Engine poll failed: {message}"));
                let event = ErrorEvent::new(format!("Engine poll failed: {message}"));
                self.end_session(Some(Event::Error(event)));
            }
            PollExit::Finished { target_stopped } => {
                let state = self.state.get();
                if state == ConnectionState::Closed {
                    return;
                }
                tracing::debug!(target: targets::CLIENT, client = self.id, %state, target_stopped, "poll thread exited before close");
                self.end_session(Some(Event::Close(CloseEvent::new(
                    1006,
                    "engine stopped without closing",
                ))));
            }
        }
    }
}
