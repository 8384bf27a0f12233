//! Metrics collection and export for Cord.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use cord_core::HubStats;
use cord_transport::SessionEnd;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "cord_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "cord_connections_active";
    pub const SESSIONS_ENDED: &str = "cord_sessions_ended_total";
    pub const MESSAGES_TOTAL: &str = "cord_messages_total";
    pub const MESSAGES_BYTES: &str = "cord_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "cord_channels_active";
    pub const USERS_ONLINE: &str = "cord_users_online";
    pub const SLOW_CONSUMER_DROPS: &str = "cord_slow_consumer_drops_total";
    pub const AUTH_FAILURES: &str = "cord_auth_failures_total";
    pub const ERRORS_TOTAL: &str = "cord_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::SESSIONS_ENDED, "Sessions ended, by reason");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of socket messages");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of socket messages");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels with at least one subscriber");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_counter!(
        names::SLOW_CONSUMER_DROPS,
        "Connections dropped because their outbound queue was full"
    );
    metrics::describe_counter!(names::AUTH_FAILURES, "Rejected credentials and tokens");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_session_end(end: SessionEnd) {
    counter!(names::SESSIONS_ENDED, "reason" => session_end_label(end)).increment(1);
}

pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_auth_failure(surface: &'static str) {
    counter!(names::AUTH_FAILURES, "surface" => surface).increment(1);
}

pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish a hub snapshot.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::CHANNELS_ACTIVE).set(stats.channels as f64);
    gauge!(names::USERS_ONLINE).set(stats.online_users as f64);
    counter!(names::SLOW_CONSUMER_DROPS).absolute(stats.slow_consumer_drops);
}

fn session_end_label(end: SessionEnd) -> &'static str {
    match end {
        SessionEnd::ClientClosed => "client_closed",
        SessionEnd::ReadTimeout => "read_timeout",
        SessionEnd::ReadFailed => "read_failed",
        SessionEnd::MessageTooLarge => "message_too_large",
        SessionEnd::QueueClosed => "queue_closed",
        SessionEnd::WriteFailed => "write_failed",
        SessionEnd::PingFailed => "ping_failed",
        SessionEnd::HubUnavailable => "hub_unavailable",
    }
}

/// Records a connection on creation and a disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
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
