//! Connects a client to the in-process echo engine, exchanges a few
//! messages, probes liveness and shuts down.
//!
//! Run with `RUST_LOG=wsbridge=debug` to watch the session threads work.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wsbridge::engine::LoopbackEngine;
use wsbridge::{Client, ClientConfig};

fn main() -> wsbridge::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let engine = Arc::new(LoopbackEngine::new());
    let config = ClientConfig::new()
        .ping_timeout(Duration::from_secs(2))
        .thread_prefix("probe");
    let client = Client::builder("ws://localhost:9001/echo")
        .config(config)
        .build(&engine.factory())?;

    client.on_open().connect(|_| tracing::info!("open"));
    client.on_message().connect(|message| {
        tracing::info!(opcode = ?message.opcode(), text = message.text(), "message");
    });
    client.on_error().connect(|error| tracing::warn!(%error, "error"));
    client.on_close().connect(|close| {
        tracing::info!(code = close.code, reason = %close.reason, clean = close.was_clean(), "closed");
    });

    client.connect()?;
    client.send_text("hello")?;
    client.send_binary(b"\x00\x01\x02")?;

    client.ping_blocking(b"probe")?;
    tracing::info!(alive = client.is_alive(), "liveness");

    client.close_with_reason(1000, "done")?;
    client.dispose();
    Ok(())
}
