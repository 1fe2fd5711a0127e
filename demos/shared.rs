//! Two handles multiplexed over one physical connection.
//!
//! Both handles see every inbound message. The socket stays up until the last handle is
//! dropped.
//!
//! ```sh
//! RUST_LOG=socket_lifecycle=debug,shared=info cargo run --example shared -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use socket_lifecycle::Client;
use socket_lifecycle::ws::config::Options;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let client = Client::default();
    let prices = client.open(
        endpoint.as_str(),
        Options::default()
            .shared()
            .on_open(|| info!(handle = "prices", "open")),
    )?;
    let trades = client.open(
        endpoint.as_str(),
        Options::default()
            .shared()
            .on_open(|| info!(handle = "trades", "open")),
    )?;
    info!(
        connections = client.registry().len(),
        subscribers = ?client.registry().subscriber_count(&endpoint),
        "registry"
    );

    let mut trade_messages = Box::pin(trades.messages()?);
    prices.send(r#"{"subscribe":"prices"}"#, true)?;

    // The echo of a message sent through one handle reaches both
    while let Ok(Some(message)) = timeout(Duration::from_secs(5), trade_messages.next()).await {
        info!(handle = "trades", message = ?message?.as_text());
    }

    drop(prices);
    info!(
        subscribers = ?client.registry().subscriber_count(&endpoint),
        state = %trades.state(),
        "prices dropped"
    );

    drop(trades);
    info!(connections = client.registry().len(), "all handles dropped");

    Ok(())
}
