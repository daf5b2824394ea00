//! Client behavior against the in-process loopback engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wsbridge::engine::LoopbackEngine;
use wsbridge::{Client, ClientConfig, ConnectionState, EngineResult, Error, IdGenerator, Opcode};

fn fast_config() -> ClientConfig {
    ClientConfig::new()
        .ping_timeout(Duration::from_millis(500))
        .alive_debounce(Duration::ZERO)
}

fn setup() -> (Arc<LoopbackEngine>, Arc<Client>) {
    let engine = Arc::new(LoopbackEngine::new());
    let client = Client::builder("ws://127.0.0.1:9001/echo")
        .config(fast_config())
        .id_generator(Arc::new(IdGenerator::new()))
        .build(&engine.factory())
        .unwrap();
    (engine, Arc::new(client))
}

/// Record every event as a short string.
fn record(client: &Client) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    client.on_open().connect(move |_| log.lock().push("open".to_string()));

    let log = events.clone();
    client
        .on_close()
        .connect(move |close| log.lock().push(format!("close:{}:{}", close.code, close.reason)));

    let log = events.clone();
    client
        .on_error()
        .connect(move |error| log.lock().push(format!("error:{}", error.message)));

    let log = events.clone();
    client.on_message().connect(move |message| {
        let entry = match message.opcode() {
            Opcode::Text => format!("text:{}", message.text()),
            Opcode::Binary => format!("binary:{:?}", message.raw_data()),
            Opcode::Ping => "ping".to_string(),
            Opcode::Pong => format!("pong:{:?}", message.raw_data()),
        };
        log.lock().push(entry);
    });

    events
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn wait_for_event(events: &Arc<Mutex<Vec<String>>>, prefix: &str) -> bool {
    wait_until(Duration::from_secs(5), || {
        events.lock().iter().any(|e| e.starts_with(prefix))
    })
}

#[test]
fn test_connect_opens_and_echoes() {
    let (engine, client) = setup();
    let events = record(&client);

    client.connect().unwrap();
    assert_eq!(client.ready_state(), ConnectionState::Open);
    assert_eq!(engine.connects(), 1);

    client.send_text("hello").unwrap();
    client.send_binary(&[1, 2, 3]).unwrap();
    assert!(wait_for_event(&events, "binary"));

    assert_eq!(
        events.lock().as_slice(),
        ["open", "text:hello", "binary:[1, 2, 3]"]
    );
    client.dispose();
}

#[test]
fn test_events_are_delivered_in_order() {
    let (_engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    for i in 0..200 {
        client.send_text(&i.to_string()).unwrap();
    }
    assert!(wait_for_event(&events, "text:199"));

    let received: Vec<String> = events
        .lock()
        .iter()
        .filter_map(|e| e.strip_prefix("text:").map(str::to_string))
        .collect();
    let expected: Vec<String> = (0..200).map(|i: i32| i.to_string()).collect();
    assert_eq!(received, expected);
    client.dispose();
}

#[test]
fn test_deliveries_never_overlap() {
    let (_engine, client) = setup();
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let delivered = Arc::new(AtomicUsize::new(0));

    {
        let active = active.clone();
        let overlapped = overlapped.clone();
        let delivered = delivered.clone();
        client.on_message().connect(move |_| {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            active.fetch_sub(1, Ordering::SeqCst);
            delivered.fetch_add(1, Ordering::SeqCst);
        });
    }

    client.connect().unwrap();
    let senders: Vec<_> = (0..4)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    client.send_text(&format!("{t}-{i}")).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || delivered.load(Ordering::SeqCst) == 100));
    assert!(!overlapped.load(Ordering::SeqCst));
    client.dispose();
}

#[test]
fn test_blocking_close() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    client.close().unwrap();
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert!(!engine.is_open());
    assert!(wait_for_event(&events, "close"));
    assert_eq!(events.lock().last().map(String::as_str), Some("close:1001:Going away"));

    // Closing again is a no-op.
    client.close().unwrap();
    client.dispose();
}

#[test]
fn test_close_with_reason() {
    let (_engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    client.close_with_reason(1000, "done").unwrap();
    assert!(wait_for_event(&events, "close"));
    assert!(events.lock().contains(&"close:1000:done".to_string()));
    client.dispose();
}

#[test]
fn test_async_close_and_reconnect() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    client.close_async().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        client.ready_state() == ConnectionState::Closed
    }));
    assert!(wait_for_event(&events, "close"));

    client.connect().unwrap();
    assert_eq!(engine.connects(), 2);
    client.send_text("again").unwrap();
    assert!(wait_for_event(&events, "text:again"));

    let opens = events.lock().iter().filter(|e| *e == "open").count();
    assert_eq!(opens, 2);
    client.dispose();
}

/// Records open and close with a slow close slot, flagging any overlap.
fn record_slow_close(client: &Client, pause: Duration) -> (Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let (log, busy, overlap) = (events.clone(), active.clone(), overlapped.clone());
    client.on_open().connect(move |_| {
        if busy.fetch_add(1, Ordering::SeqCst) != 0 {
            overlap.store(true, Ordering::SeqCst);
        }
        log.lock().push("open".to_string());
        busy.fetch_sub(1, Ordering::SeqCst);
    });

    let (log, busy, overlap) = (events.clone(), active, overlapped.clone());
    client.on_close().connect(move |close| {
        if busy.fetch_add(1, Ordering::SeqCst) != 0 {
            overlap.store(true, Ordering::SeqCst);
        }
        log.lock().push(format!("close-start {}", close.code));
        thread::sleep(pause);
        log.lock().push("close-end".to_string());
        busy.fetch_sub(1, Ordering::SeqCst);
    });

    (events, overlapped)
}

#[test]
fn test_reconnect_waits_for_previous_handlers() {
    let (engine, client) = setup();
    let (events, overlapped) = record_slow_close(&client, Duration::from_millis(300));

    client.connect().unwrap();
    client.close().unwrap();
    client.connect().unwrap();
    assert_eq!(engine.connects(), 2);

    assert!(wait_until(Duration::from_secs(5), || {
        events.lock().iter().filter(|e| *e == "open").count() == 2
    }));
    assert_eq!(
        events.lock().as_slice(),
        ["open", "close-start 1001", "close-end", "open"]
    );
    assert!(!overlapped.load(Ordering::SeqCst));
    client.dispose();
}

#[test]
fn test_reconnect_from_close_handler() {
    let (engine, client) = setup();
    let reconnected = Arc::new(AtomicBool::new(false));

    // Connected first, so the reconnect starts before the slow slot runs.
    {
        let weak = Arc::downgrade(&client);
        let reconnected = reconnected.clone();
        client.on_close().connect(move |_| {
            if reconnected.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(client) = weak.upgrade() {
                client.connect_async().unwrap();
            }
        });
    }
    let (events, overlapped) = record_slow_close(&client, Duration::from_millis(100));

    client.connect().unwrap();
    engine.server_close(1000, "restart");
    assert!(wait_until(Duration::from_secs(5), || {
        events.lock().iter().filter(|e| *e == "open").count() == 2
    }));
    assert_eq!(
        events.lock().as_slice(),
        ["open", "close-start 1000", "close-end", "open"]
    );
    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(client.ready_state(), ConnectionState::Open);
    client.dispose();
}

#[test]
fn test_connect_while_open_is_invalid() {
    let (_engine, client) = setup();
    client.connect().unwrap();
    assert!(matches!(client.connect(), Err(Error::InvalidState(_))));
    assert!(matches!(client.connect_async(), Err(Error::InvalidState(_))));
    client.dispose();
}

#[test]
fn test_close_during_handshake() {
    let (engine, client) = setup();
    let events = record(&client);
    engine.set_open_delay(30);

    client.connect_async().unwrap();
    assert_eq!(client.ready_state(), ConnectionState::Connecting);
    client.close().unwrap();

    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert!(wait_for_event(&events, "close"));
    assert!(!events.lock().contains(&"open".to_string()));
    client.dispose();
}

#[test]
fn test_refused_connect() {
    let (engine, client) = setup();
    let events = record(&client);
    engine.refuse_connections(Some("connection refused"));

    match client.connect() {
        Err(Error::ConnectFailure(message)) => {
            assert!(message.contains("connection refused"), "{message}");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert_eq!(client.last_error().as_deref(), Some("connection refused"));
    assert!(wait_for_event(&events, "error"));
    assert_eq!(
        events.lock().as_slice(),
        ["error:Connect error: connection refused"]
    );

    engine.refuse_connections(None);
    client.connect().unwrap();
    assert!(client.last_error().is_none());
    client.dispose();
}

#[test]
fn test_server_close() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    engine.server_close(1000, "bye");
    assert!(wait_for_event(&events, "close"));
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert_eq!(events.lock().as_slice(), ["open", "close:1000:bye"]);

    // Close after a server close is a no-op.
    client.close().unwrap();
    client.dispose();
}

#[test]
fn test_error_while_open_closes() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    engine.inject_error("protocol violation");
    assert!(wait_for_event(&events, "close"));
    assert_eq!(client.ready_state(), ConnectionState::Closed);
    assert_eq!(
        events.lock().as_slice(),
        ["open", "error:protocol violation", "close:1001:Going away"]
    );
    client.dispose();
}

#[test]
fn test_failing_send() {
    let (engine, client) = setup();
    let events = record(&client);
    engine.fail_send_at(501);
    client.connect().unwrap();

    for i in 0..500 {
        client.send_text(&format!("message {i}")).unwrap();
    }
    match client.send_text("one too many") {
        Err(Error::SendFailure { result }) => assert_eq!(result, EngineResult::Unknown),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(engine.sends(), 501);

    for i in 500..510 {
        client.send_text(&format!("message {i}")).unwrap();
    }
    assert_eq!(engine.sends(), 511);

    // An error while open also closes, so it comes after the last burst.
    engine.inject_error("peer reset");
    assert!(wait_for_event(&events, "close"));

    let mut expected = vec!["open".to_string()];
    expected.extend((0..510).map(|i| format!("text:message {i}")));
    expected.push("error:peer reset".to_string());
    expected.push("close:1001:Going away".to_string());
    assert_eq!(*events.lock(), expected);
    assert!(matches!(client.send_text("too late"), Err(Error::SendFailure { .. })));
    client.dispose();
}

#[test]
fn test_ping_blocking_is_answered() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    client.ping_blocking(b"are you there").unwrap();
    assert_eq!(engine.pings(), 1);

    // A correlated pong is consumed, not surfaced.
    client.send_text("after").unwrap();
    assert!(wait_for_event(&events, "text:after"));
    assert!(!events.lock().iter().any(|e| e.starts_with("pong")));

    // The payload is no longer pending, so a repeat of the pong is forwarded.
    engine.inject_pong(&b"are you there"[..]);
    assert!(wait_for_event(&events, "pong"));
    client.dispose();
}

#[test]
fn test_uncorrelated_pong_is_forwarded() {
    let (engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();

    engine.inject_pong(&b"\x01\x02"[..]);
    client.ping(b"free").unwrap();
    assert!(wait_for_event(&events, "pong:[102"));

    let pongs: Vec<String> = events
        .lock()
        .iter()
        .filter(|e| e.starts_with("pong"))
        .cloned()
        .collect();
    assert_eq!(pongs, ["pong:[1, 2]", "pong:[102, 114, 101, 101]"]);
    client.dispose();
}

#[test]
fn test_ping_timeout() {
    let (engine, client) = setup();
    engine.set_silent_pings(true);
    client.connect().unwrap();

    let started = Instant::now();
    assert!(matches!(
        client.ping_blocking_timeout(b"anyone", Duration::from_millis(30)),
        Err(Error::Timeout)
    ));
    assert!(started.elapsed() >= Duration::from_millis(30));

    // A pong arriving late is no longer correlated and is forwarded.
    let events = record(&client);
    engine.inject_pong(&b"anyone"[..]);
    assert!(wait_for_event(&events, "pong"));
    client.dispose();
}

#[test]
fn test_ping_interrupted_by_error() {
    let (engine, client) = setup();
    engine.set_silent_pings(true);
    client.connect().unwrap();

    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let probe: [u8; 16] = rand::random();
            let result = client.ping_blocking_timeout(&probe, Duration::from_secs(30));
            (result, started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(20));
    engine.inject_error("connection reset");

    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(elapsed < Duration::from_secs(5));
    client.dispose();
}

#[test]
fn test_ping_failure_is_send_failure() {
    let (_engine, client) = setup();
    match client.ping_blocking(b"early") {
        Err(Error::SendFailure { result }) => assert_eq!(result, EngineResult::InvalidState),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_is_alive() {
    let (engine, client) = setup();
    assert!(!client.is_alive());

    client.connect().unwrap();
    assert!(client.is_alive());

    engine.set_silent_pings(true);
    assert!(!client.is_alive());

    engine.set_silent_pings(false);
    client.close().unwrap();
    assert!(!client.is_alive());
    client.dispose();
}

#[test]
fn test_is_alive_debounce_skips_probe() {
    let engine = Arc::new(LoopbackEngine::new());
    let client = Client::builder("ws://localhost")
        .config(ClientConfig::new().alive_debounce(Duration::from_secs(60)))
        .build(&engine.factory())
        .unwrap();
    client.connect().unwrap();

    assert!(client.is_alive());
    assert_eq!(engine.pings(), 1);
    engine.set_silent_pings(true);
    assert!(client.is_alive());
    assert_eq!(engine.pings(), 1);
    client.dispose();
}

#[test]
fn test_blocking_calls_from_handler_are_refused() {
    let (_engine, client) = setup();
    let results = Arc::new(Mutex::new(Vec::new()));

    {
        let weak = Arc::downgrade(&client);
        let results = results.clone();
        client.on_message().connect(move |_| {
            if let Some(client) = weak.upgrade() {
                let mut results = results.lock();
                results.push(matches!(client.close(), Err(Error::InvalidState(_))));
                results.push(matches!(client.connect(), Err(Error::InvalidState(_))));
                results.push(matches!(client.ping_blocking(b"x"), Err(Error::InvalidState(_))));
                results.push(client.is_alive());
                results.push(client.close_async().is_ok());
            }
        });
    }

    client.connect().unwrap();
    client.send_text("trigger").unwrap();
    assert!(wait_until(Duration::from_secs(5), || results.lock().len() >= 5));
    assert!(results.lock().iter().all(|ok| *ok), "{:?}", results.lock());

    assert!(wait_until(Duration::from_secs(5), || {
        client.ready_state() == ConnectionState::Closed
    }));
    client.dispose();
}

#[test]
fn test_panicking_slot_does_not_stop_delivery() {
    let (_engine, client) = setup();
    let events = record(&client);
    client.on_message().connect(|message| {
        if message.text() == "boom" {
            panic!("slot failure");
        }
    });

    client.connect().unwrap();
    client.send_text("boom").unwrap();
    client.send_text("after").unwrap();
    assert!(wait_for_event(&events, "text:after"));
    client.dispose();
}

#[test]
fn test_dispose_twice() {
    let (engine, client) = setup();
    client.connect().unwrap();

    client.dispose();
    client.dispose();
    assert!(client.is_disposed());
    assert!(engine.is_deleted());

    assert!(matches!(client.send_text("x"), Err(Error::Disposed)));
    assert!(matches!(client.send_binary(&[1]), Err(Error::Disposed)));
    assert!(matches!(client.ping(b"x"), Err(Error::Disposed)));
    assert!(matches!(client.ping_blocking(b"x"), Err(Error::Disposed)));
    assert!(matches!(client.close(), Err(Error::Disposed)));
    assert!(matches!(client.connect_async(), Err(Error::Disposed)));
    assert!(!client.is_alive());
}

#[test]
fn test_dispose_discards_signal_connections() {
    let (_engine, client) = setup();
    let events = record(&client);
    client.connect().unwrap();
    assert!(wait_for_event(&events, "open"));

    client.dispose();
    assert_eq!(client.on_open().connection_count(), 0);
    assert_eq!(client.on_message().connection_count(), 0);
}

#[test]
fn test_dispose_from_close_handler() {
    let (engine, client) = setup();
    let disposed = Arc::new(AtomicBool::new(false));

    {
        let weak = Arc::downgrade(&client);
        let disposed = disposed.clone();
        client.on_close().connect(move |_| {
            if let Some(client) = weak.upgrade() {
                client.dispose();
                disposed.store(client.is_disposed(), Ordering::SeqCst);
            }
        });
    }

    client.connect().unwrap();
    engine.server_close(1000, "bye");
    assert!(wait_until(Duration::from_secs(5), || disposed.load(Ordering::SeqCst)));
    assert!(engine.is_deleted());
}

#[test]
fn test_dispose_from_message_handler() {
    let (engine, client) = setup();
    let done = Arc::new(AtomicBool::new(false));

    {
        let weak = Arc::downgrade(&client);
        let done = done.clone();
        client.on_message().connect(move |_| {
            if let Some(client) = weak.upgrade() {
                client.dispose();
                done.store(true, Ordering::SeqCst);
            }
        });
    }

    client.connect().unwrap();
    client.send_text("last words").unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
    assert!(engine.is_deleted());
    assert_eq!(client.ready_state(), ConnectionState::Closed);
}

#[test]
fn test_is_secure() {
    let engine = Arc::new(LoopbackEngine::new());
    let secure = Client::new("wss://example.com/feed", &engine.factory()).unwrap();
    let plain = Client::new("ws://example.com/feed", &engine.factory()).unwrap();
    assert!(secure.is_secure());
    assert!(!plain.is_secure());
}

#[test]
fn test_thread_names_follow_config() {
    let engine = Arc::new(LoopbackEngine::new());
    let config = ClientConfig::from_toml_str("thread_prefix = \"ticker\"").unwrap();
    let client = Client::builder("ws://localhost")
        .config(config)
        .build(&engine.factory())
        .unwrap();

    let name = Arc::new(Mutex::new(None));
    {
        let name = name.clone();
        client.on_open().connect(move |_| {
            *name.lock() = thread::current().name().map(str::to_string);
        });
    }
    client.connect().unwrap();
    assert!(wait_until(Duration::from_secs(5), || name.lock().is_some()));

    let name = name.lock().clone().unwrap_or_default();
    assert!(
        name.starts_with(&format!("ticker-dispatch-{}.", client.id())),
        "{name}"
    );
    client.dispose();
}
