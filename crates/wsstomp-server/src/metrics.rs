//! Prometheus metrics recorder and the names recorded by the server.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;
use wsstomp_broker::ConnectionReport;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Sessions ended (counter, labels: outcome).
pub const STOMP_SESSIONS_ENDED_TOTAL: &str = "stomp_sessions_ended_total";
/// SEND frames routed to a destination (counter).
pub const STOMP_MESSAGES_PUBLISHED_TOTAL: &str = "stomp_messages_published_total";
/// MESSAGE frames handed to subscribers (counter).
pub const STOMP_MESSAGES_DELIVERED_TOTAL: &str = "stomp_messages_delivered_total";
/// SEND frames dropped for lack of a destination (counter).
pub const STOMP_MESSAGES_DROPPED_TOTAL: &str = "stomp_messages_dropped_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";

/// Record the counters of a finished connection.
pub fn record_report(report: &ConnectionReport, lifetime_secs: f64) {
    let summary = &report.summary;
    metrics::counter!(STOMP_SESSIONS_ENDED_TOTAL, "outcome" => report.outcome.as_str()).increment(1);
    metrics::counter!(STOMP_MESSAGES_PUBLISHED_TOTAL).increment(as_u64(summary.enqueued));
    metrics::counter!(STOMP_MESSAGES_DELIVERED_TOTAL).increment(as_u64(summary.delivered));
    metrics::counter!(STOMP_MESSAGES_DROPPED_TOTAL).increment(as_u64(summary.dropped));
    metrics::histogram!(WS_CONNECTION_DURATION_SECONDS).record(lifetime_secs);
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
