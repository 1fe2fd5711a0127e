//! Keeps one supervised connection to an echo server alive.
//!
//! Sends a message every few seconds, prints the echoes and reconnects with exponential
//! backoff whenever the connection drops without a close handshake.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=socket_lifecycle=debug,echo=info cargo run --example echo -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use socket_lifecycle::Client;
use socket_lifecycle::ws::config::{
    ExponentialBackoffConfig, HeartbeatConfig, Options, ReconnectInterval,
};
use tokio::time::{interval, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let options = Options::default()
        .reconnect_attempts(10)
        .reconnect_interval(ReconnectInterval::Exponential(
            ExponentialBackoffConfig::default(),
        ))
        .should_reconnect(|close| !close.was_clean)
        .heartbeat(
            HeartbeatConfig::builder()
                .interval(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build(),
        )
        .on_open(|| info!("connected"))
        .on_close(|close| info!(code = close.code, reason = %close.reason, "closed"))
        .on_error(|error| warn!(error = %error.message, "transport error"))
        .on_reconnect_stop(|max| warn!(max_attempts = max, "giving up"));

    let client = Client::default();
    let connection = client.open(endpoint.as_str(), options)?;
    let mut messages = Box::pin(connection.messages()?);
    let mut ticker = interval(Duration::from_secs(3));

    for n in 0..5 {
        ticker.tick().await;
        let delivery = connection.send(format!("hello #{n}"), true)?;
        info!(n, ?delivery, "sent");

        match timeout(Duration::from_secs(5), messages.next()).await {
            Ok(Some(Ok(message))) => {
                info!(echo = ?message.as_text(), state = %connection.state());
            }
            Ok(Some(Err(e))) => warn!(error = %e, "stream error"),
            Ok(None) => break,
            Err(_) => warn!("no echo within 5s"),
        }
    }

    connection.dispose();
    info!(state = %connection.state(), "done");

    Ok(())
}
