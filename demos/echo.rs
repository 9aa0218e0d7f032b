//! Keeps a connection to an echo server alive and prints what comes back.
//!
//! This example shows how to:
//! 1. Share one [`Registry`] between managers
//! 2. Send JSON before the connection is open
//! 3. React to closes, errors and visibility changes
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,resilient_ws=debug cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=echo.log RUST_LOG=debug cargo run --example echo --features tracing
//! ```

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use resilient_ws::config::{HeartbeatConfig, ReconnectConfig};
use resilient_ws::{
    CloseReason, Config, ConnectionManager, Error, EventHandler, JsonParser, Registry, Visibility,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_ENDPOINT: &str = "wss://echo.websocket.org";

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    seq: u64,
    text: String,
}

struct Printer;

impl EventHandler<Echo> for Printer {
    fn on_open(&mut self) {
        info!("connection open");
    }

    fn on_message(&mut self, message: Echo) {
        info!(seq = message.seq, text = %message.text, "echoed");
    }

    fn on_close(&mut self, reason: &CloseReason) {
        warn!(%reason, "connection closed");
    }

    fn on_error(&mut self, error: &Error) {
        error!(%error, "connection error");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());

    let registry = Arc::new(Registry::default());
    let config = Config::builder()
        .endpoint(endpoint)
        .heartbeat(HeartbeatConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(3),
        ))
        .reconnect(ReconnectConfig::linear(Duration::ZERO, Duration::from_secs(2)))
        .build();

    // Echo servers greet with plain text; JsonParser reports that through on_error and moves on
    let manager = ConnectionManager::new(config, JsonParser::<Echo>::new(), Printer, registry)?;

    manager.send_json(&Echo {
        seq: 0,
        text: "sent before open".to_owned(),
    })?;
    manager.ready().await?;
    info!(state = ?manager.state(), "ready");

    for seq in 1..=5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.send_json(&Echo {
            seq,
            text: format!("message {seq}"),
        })?;
    }

    // A resumed app skips whatever backoff is pending
    manager.notify_visibility(Visibility::Visible)?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.close();
    info!(state = ?manager.state(), "done");

    Ok(())
}
