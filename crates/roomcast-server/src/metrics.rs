//! Metrics collection and export for Roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. The core crate records its own counters
//! (joins, evictions, published events, delivery faults) through the
//! same facade; they are described here so the exporter carries help text.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const FRAMES_TOTAL: &str = "roomcast_frames_total";
    pub const FRAME_BYTES: &str = "roomcast_frame_bytes";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const HANDLER_SECONDS: &str = "roomcast_handler_seconds";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";

    // Recorded by roomcast-core and roomcast-transport.
    pub const JOINS_TOTAL: &str = "roomcast_joins_total";
    pub const EVICTIONS_TOTAL: &str = "roomcast_evictions_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "roomcast_events_published_total";
    pub const DELIVERY_FAULTS_TOTAL: &str = "roomcast_delivery_faults_total";
    pub const PUSH_CLIENTS: &str = "roomcast_push_clients";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of push connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open push connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAME_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with presence state");
    metrics::describe_histogram!(
        names::HANDLER_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(names::JOINS_TOTAL, "Join attempts by result");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted by the heartbeat sweep"
    );
    metrics::describe_counter!(
        names::EVENTS_PUBLISHED_TOTAL,
        "Events published on the bus by kind"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAULTS_TOTAL,
        "Events dropped for a single subscriber"
    );
    metrics::describe_gauge!(names::PUSH_CLIENTS, "Push clients registered with the adapter");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new push connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a push disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::HANDLER_SECONDS).record(seconds);
}

/// Update the active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
