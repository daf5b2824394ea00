//! Client behavior when the engine itself misbehaves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wsbridge::engine::{
    CloseHandler, ErrorHandler, LoopbackEngine, MessageHandler, OpenHandler, Pollable, PongHandler,
};
use wsbridge::{Client, ClientConfig, ConnectionState, Engine, EngineResult, Error};

/// Loopback engine with switches for failures the loopback cannot produce.
#[derive(Default)]
struct FlakyEngine {
    inner: LoopbackEngine,
    panic_on_poll: AtomicBool,
    refuse_close: AtomicBool,
    vanish: AtomicBool,
}

impl Pollable for FlakyEngine {
    fn poll(&self) -> u64 {
        if self.panic_on_poll.load(Ordering::SeqCst) {
            panic!("engine exploded");
        }
        self.inner.poll()
    }

    fn stopped(&self) -> bool {
        self.vanish.load(Ordering::SeqCst) || self.inner.stopped()
    }
}

impl Engine for FlakyEngine {
    fn connect(&self) -> EngineResult {
        self.inner.connect()
    }

    fn close(&self, code: u16, reason: &str) -> EngineResult {
        if self.refuse_close.load(Ordering::SeqCst) {
            return EngineResult::Unknown;
        }
        self.inner.close(code, reason)
    }

    fn send_text(&self, text: &str) -> EngineResult {
        self.inner.send_text(text)
    }

    fn send_binary(&self, data: &[u8]) -> EngineResult {
        self.inner.send_binary(data)
    }

    fn ping(&self, payload: &[u8]) -> EngineResult {
        self.inner.ping(payload)
    }

    fn delete(&self) {
        self.inner.delete();
    }

    fn set_open_handler(&self, handler: Option<OpenHandler>) {
        self.inner.set_open_handler(handler);
    }

    fn set_close_handler(&self, handler: Option<CloseHandler>) {
        self.inner.set_close_handler(handler);
    }

    fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        self.inner.set_error_handler(handler);
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        self.inner.set_message_handler(handler);
    }

    fn set_pong_handler(&self, handler: Option<PongHandler>) {
        self.inner.set_pong_handler(handler);
    }
}

fn setup() -> (Arc<FlakyEngine>, Client, Arc<Mutex<Vec<String>>>) {
    let engine = Arc::new(FlakyEngine::default());
    let factory = {
        let engine = engine.clone();
        move |_: &url::Url, _: &[String]| -> Result<Arc<dyn Engine>, String> { Ok(engine.clone()) }
    };
    let client = Client::builder("ws://localhost:9001")
        .config(ClientConfig::new().close_grace_iterations(10))
        .build(&factory)
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    client
        .on_error()
        .connect(move |error| log.lock().push(format!("error:{}", error.message)));
    let log = events.clone();
    client
        .on_close()
        .connect(move |close| log.lock().push(format!("close:{}:{}", close.code, close.reason)));

    (engine, client, events)
}

fn wait_for(events: &Arc<Mutex<Vec<String>>>, prefix: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if events.lock().iter().any(|e| e.starts_with(prefix)) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_poll_panic_ends_session() {
    let (engine, client, events) = setup();
    client.connect().unwrap();

    engine.panic_on_poll.store(true, Ordering::SeqCst);
    assert!(wait_for(&events, "error"));
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert_eq!(
        events.lock().as_slice(),
        ["error:Engine poll failed: engine exploded"]
    );
    assert!(
        client
            .last_error()
            .is_some_and(|e| e.contains("engine exploded"))
    );

    client.dispose();
    assert!(engine.inner.is_deleted());
}

#[test]
fn test_refused_close_forces_closed() {
    let (engine, client, events) = setup();
    client.connect().unwrap();

    engine.refuse_close.store(true, Ordering::SeqCst);
    match client.close() {
        Err(Error::SendFailure { result }) => assert_eq!(result, EngineResult::Unknown),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(client.ready_state(), ConnectionState::Closed);

    assert!(wait_for(&events, "error"));
    assert_eq!(
        events.lock().as_slice(),
        ["error:Close failed: engine returned Unknown"]
    );
    client.dispose();
}

#[test]
fn test_engine_stopping_silently_is_a_close() {
    let (engine, client, events) = setup();
    client.connect().unwrap();

    engine.vanish.store(true, Ordering::SeqCst);
    assert!(wait_for(&events, "close"));
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert_eq!(
        events.lock().as_slice(),
        ["close:1006:engine stopped without closing"]
    );
    client.dispose();
}

#[test]
fn test_connect_rejected_by_engine() {
    let (engine, client, _events) = setup();
    client.connect().unwrap();
    client.close().unwrap();

    engine.inner.delete();
    match client.connect() {
        Err(Error::ConnectFailure(message)) => {
            assert_eq!(message, "Connect failed: engine returned InvalidState");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(client.ready_state(), ConnectionState::Closed);
}
