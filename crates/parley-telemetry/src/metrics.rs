//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder. Call once at startup; the handle
/// renders the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants shared by the server crates.

/// Sessions created (counter, labels: transport).
pub const SESSIONS_CREATED_TOTAL: &str = "sessions_created_total";
/// Sessions torn down (counter, labels: reason).
pub const SESSIONS_CLOSED_TOTAL: &str = "sessions_closed_total";
/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Long-poll sessions evicted by the LRU sweep (counter).
pub const SESSIONS_EVICTED_TOTAL: &str = "sessions_evicted_total";
/// Completed pairings (counter).
pub const SESSIONS_PAIRED_TOTAL: &str = "sessions_paired_total";
/// Inbound client messages (counter, labels: kind).
pub const CLIENT_MESSAGES_TOTAL: &str = "client_messages_total";
/// Requests answered with an error (counter, labels: kind).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Live topic actors (gauge).
pub const TOPICS_ACTIVE: &str = "topics_active";
/// Topic actors started (counter, labels: category).
pub const TOPICS_STARTED_TOTAL: &str = "topics_started_total";
/// Data messages accepted by topics (counter).
pub const MESSAGES_PUBLISHED_TOTAL: &str = "messages_published_total";
/// Cross-topic notifications dropped because the target mailbox was full (counter).
pub const PRESENCE_DROPS_TOTAL: &str = "presence_drops_total";
/// Outbound write duration in seconds (histogram).
pub const WRITE_DURATION_SECONDS: &str = "write_duration_seconds";
