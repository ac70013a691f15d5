//! # Roomcast Server
//!
//! Room-based realtime chat server with a push (WebSocket) channel and a
//! pull bridge (HTTP + server-sent events) sharing one presence registry.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast-server
//!
//! # Run with a custom config file
//! ROOMCAST_CONFIG=/path/to/roomcast.toml roomcast-server
//!
//! # Override single settings
//! ROOMCAST_PORT=8080 ROOMCAST_HEARTBEAT__PROBE_INTERVAL_MS=5000 roomcast-server
//! ```

mod config;
mod handlers;
mod metrics;
mod routes;
mod socket;
mod state;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Roomcast server on {}:{} (probe interval {:?})",
        config.host,
        config.port,
        config.probe_interval()
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    routes::run_server(config).await?;

    Ok(())
}
