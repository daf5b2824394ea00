//! In-process engine that echoes back whatever it is sent.
//!
//! [`LoopbackEngine`] behaves like a network engine talking to an echo
//! server: operations queue work, and the resulting callbacks fire from
//! [`Pollable::poll`] on whatever thread polls it. Text and binary messages
//! come back as messages, pings come back as pongs, and a close request
//! completes with a close callback.
//!
//! Scripting controls make the awkward cases reproducible: refused
//! connections, failing sends, unanswered pings, server-initiated errors and
//! closes, and slow handshakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;
use wsbridge_core::Pollable;
use wsbridge_core::logging::targets;

use super::{
    CloseHandler, Engine, EngineFactory, EngineResult, ErrorHandler, MessageHandler, OpenHandler,
    Opcode, PongHandler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
    Closing,
    Stopped,
}

#[derive(Debug)]
enum Action {
    Open,
    Message(Bytes, Opcode),
    Pong(Bytes),
    Error { message: String, fatal: bool },
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct Scheduled {
    after_polls: u32,
    action: Action,
}

#[derive(Debug)]
struct Script {
    refuse: Option<String>,
    fail_send_at: Option<u64>,
    silent_pings: bool,
    echo: bool,
    open_delay: u32,
    close_delay: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            refuse: None,
            fail_send_at: None,
            silent_pings: false,
            echo: true,
            open_delay: 0,
            close_delay: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    queue: VecDeque<Scheduled>,
    script: Script,
    sends: u64,
    pings: u64,
    connects: u64,
}

#[derive(Clone, Default)]
struct Handlers {
    open: Option<OpenHandler>,
    close: Option<CloseHandler>,
    error: Option<ErrorHandler>,
    message: Option<MessageHandler>,
    pong: Option<PongHandler>,
}

impl Handlers {
    fn installed(&self) -> usize {
        [
            self.open.is_some(),
            self.close.is_some(),
            self.error.is_some(),
            self.message.is_some(),
            self.pong.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// An engine connected to an in-process echo peer.
pub struct LoopbackEngine {
    inner: Mutex<Inner>,
    handlers: Mutex<Handlers>,
    deleted: AtomicBool,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Create an idle engine with echo enabled.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                queue: VecDeque::new(),
                script: Script::default(),
                sends: 0,
                pings: 0,
                connects: 0,
            }),
            handlers: Mutex::new(Handlers::default()),
            deleted: AtomicBool::new(false),
        }
    }

    /// A factory that always hands out this engine.
    pub fn factory(self: &Arc<Self>) -> impl EngineFactory + use<> {
        let engine = self.clone();
        move |_url: &Url, _protocols: &[String]| -> Result<Arc<dyn Engine>, String> {
            Ok(engine.clone())
        }
    }

    /// Make later connect attempts fail with an error callback carrying
    /// `message`. `None` accepts connections again.
    pub fn refuse_connections(&self, message: Option<&str>) {
        self.inner.lock().script.refuse = message.map(str::to_string);
    }

    /// Make the `n`-th send (counting from 1, over the engine's lifetime)
    /// return [`EngineResult::Unknown`].
    pub fn fail_send_at(&self, n: u64) {
        self.inner.lock().script.fail_send_at = Some(n);
    }

    /// Stop answering pings.
    pub fn set_silent_pings(&self, silent: bool) {
        self.inner.lock().script.silent_pings = silent;
    }

    /// Enable or disable echoing of sent messages.
    pub fn set_echo(&self, echo: bool) {
        self.inner.lock().script.echo = echo;
    }

    /// Hold the open callback back for `polls` polls after a connect.
    pub fn set_open_delay(&self, polls: u32) {
        self.inner.lock().script.open_delay = polls;
    }

    /// Hold the close callback back for `polls` polls after a close request.
    pub fn set_close_delay(&self, polls: u32) {
        self.inner.lock().script.close_delay = polls;
    }

    /// Queue a non-fatal error callback, as if the peer misbehaved.
    pub fn inject_error(&self, message: &str) {
        self.push(Action::Error {
            message: message.to_string(),
            fatal: false,
        });
    }

    /// Queue an incoming message.
    pub fn inject_message(&self, data: impl Into<Bytes>, opcode: Opcode) {
        self.push(Action::Message(data.into(), opcode));
    }

    /// Queue an incoming pong that was not requested by a ping.
    pub fn inject_pong(&self, payload: impl Into<Bytes>) {
        self.push(Action::Pong(payload.into()));
    }

    /// Close from the peer's side.
    pub fn server_close(&self, code: u16, reason: &str) {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, Phase::Open | Phase::Connecting) {
            inner.phase = Phase::Closing;
            inner.queue.push_back(Scheduled {
                after_polls: 0,
                action: Action::Close {
                    code,
                    reason: reason.to_string(),
                },
            });
        }
    }

    /// Check whether `delete` has been called.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Check whether the engine currently considers itself open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().phase == Phase::Open
    }

    /// Number of sends attempted while open.
    pub fn sends(&self) -> u64 {
        self.inner.lock().sends
    }

    /// Number of pings attempted while open.
    pub fn pings(&self) -> u64 {
        self.inner.lock().pings
    }

    /// Number of accepted `connect` calls.
    pub fn connects(&self) -> u64 {
        self.inner.lock().connects
    }

    /// Number of callbacks currently installed.
    pub fn installed_handlers(&self) -> usize {
        self.handlers.lock().installed()
    }

    fn push(&self, action: Action) {
        self.inner.lock().queue.push_back(Scheduled {
            after_polls: 0,
            action,
        });
    }

    /// Take every action that is due. An action still waiting out its delay
    /// holds back everything queued behind it.
    fn take_due(&self) -> Vec<Action> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while let Some(front) = inner.queue.front_mut() {
            if front.after_polls > 0 {
                front.after_polls -= 1;
                break;
            }
            if let Some(scheduled) = inner.queue.pop_front() {
                due.push(scheduled.action);
            }
        }
        due
    }

    /// Apply an action's phase change. Returns `false` if the action is
    /// stale and must not fire.
    fn apply(&self, action: &Action) -> bool {
        let mut inner = self.inner.lock();
        match action {
            Action::Open => match inner.phase {
                Phase::Connecting => {
                    inner.phase = Phase::Open;
                    true
                }
                // A close was requested mid-handshake; the handshake still
                // completes before the close does.
                Phase::Closing => true,
                _ => false,
            },
            Action::Error { fatal, .. } => {
                if *fatal {
                    inner.phase = Phase::Stopped;
                }
                inner.phase != Phase::Idle
            }
            Action::Close { .. } => {
                let live = inner.phase != Phase::Stopped && inner.phase != Phase::Idle;
                inner.phase = Phase::Stopped;
                live
            }
            Action::Message(..) | Action::Pong(_) => {
                matches!(inner.phase, Phase::Open | Phase::Closing)
            }
        }
    }
}

impl Pollable for LoopbackEngine {
    fn poll(&self) -> u64 {
        let due = self.take_due();
        let mut ran = 0;
        for action in due {
            if !self.apply(&action) {
                continue;
            }
            // Clone the handler out so it runs without any engine lock held.
            let handlers = self.handlers.lock().clone();
            match action {
                Action::Open => {
                    if let Some(open) = handlers.open {
                        open();
                        ran += 1;
                    }
                }
                Action::Message(data, opcode) => {
                    if let Some(message) = handlers.message {
                        message(data, opcode);
                        ran += 1;
                    }
                }
                Action::Pong(payload) => {
                    if let Some(pong) = handlers.pong {
                        pong(payload);
                        ran += 1;
                    }
                }
                Action::Error { message, .. } => {
                    if let Some(error) = handlers.error {
                        error(&message);
                        ran += 1;
                    }
                }
                Action::Close { code, reason } => {
                    if let Some(close) = handlers.close {
                        close(code, &reason);
                        ran += 1;
                    }
                }
            }
        }
        ran
    }

    fn stopped(&self) -> bool {
        matches!(self.inner.lock().phase, Phase::Idle | Phase::Stopped)
    }
}

impl Engine for LoopbackEngine {
    fn connect(&self) -> EngineResult {
        if self.is_deleted() {
            return EngineResult::InvalidState;
        }
        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Idle | Phase::Stopped) {
            return EngineResult::InvalidState;
        }
        inner.queue.clear();
        inner.phase = Phase::Connecting;
        inner.connects += 1;
        let scheduled = match inner.script.refuse.clone() {
            Some(message) => Scheduled {
                after_polls: 0,
                action: Action::Error { message, fatal: true },
            },
            None => Scheduled {
                after_polls: inner.script.open_delay,
                action: Action::Open,
            },
        };
        inner.queue.push_back(scheduled);
        tracing::trace!(target: targets::ENGINE, "loopback connecting");
        EngineResult::Ok
    }

    fn close(&self, code: u16, reason: &str) -> EngineResult {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Idle | Phase::Stopped => EngineResult::InvalidState,
            Phase::Closing => EngineResult::Ok,
            Phase::Connecting | Phase::Open => {
                inner.phase = Phase::Closing;
                let after_polls = inner.script.close_delay;
                inner.queue.push_back(Scheduled {
                    after_polls,
                    action: Action::Close {
                        code,
                        reason: reason.to_string(),
                    },
                });
                EngineResult::Ok
            }
        }
    }

    fn send_text(&self, text: &str) -> EngineResult {
        self.send(Bytes::copy_from_slice(text.as_bytes()), Opcode::Text)
    }

    fn send_binary(&self, data: &[u8]) -> EngineResult {
        self.send(Bytes::copy_from_slice(data), Opcode::Binary)
    }

    fn ping(&self, payload: &[u8]) -> EngineResult {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Open {
            return EngineResult::InvalidState;
        }
        inner.pings += 1;
        if !inner.script.silent_pings {
            inner.queue.push_back(Scheduled {
                after_polls: 0,
                action: Action::Pong(Bytes::copy_from_slice(payload)),
            });
        }
        EngineResult::Ok
    }

    fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
        self.clear_handlers();
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.phase = Phase::Stopped;
        tracing::trace!(target: targets::ENGINE, "loopback deleted");
    }

    fn set_open_handler(&self, handler: Option<OpenHandler>) {
        self.handlers.lock().open = handler;
    }

    fn set_close_handler(&self, handler: Option<CloseHandler>) {
        self.handlers.lock().close = handler;
    }

    fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        self.handlers.lock().error = handler;
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        self.handlers.lock().message = handler;
    }

    fn set_pong_handler(&self, handler: Option<PongHandler>) {
        self.handlers.lock().pong = handler;
    }
}

impl LoopbackEngine {
    fn send(&self, data: Bytes, opcode: Opcode) -> EngineResult {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Open {
            return EngineResult::InvalidState;
        }
        inner.sends += 1;
        if inner.script.fail_send_at == Some(inner.sends) {
            return EngineResult::Unknown;
        }
        if inner.script.echo {
            inner.queue.push_back(Scheduled {
                after_polls: 0,
                action: Action::Message(data, opcode),
            });
        }
        EngineResult::Ok
    }
}
