//! Prometheus metrics recorder, metric names and the hub observer.

use crate::ws::hub::Hub;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Messages enqueued but not yet delivered or failed (gauge).
pub const WS_PENDING_MESSAGES: &str = "ws_pending_messages";
/// Frames written to clients (counter).
pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
/// Frames read from clients (counter, labels: kind).
pub const WS_MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";
/// Errors (counter, labels: category).
pub const WS_ERRORS_TOTAL: &str = "ws_errors_total";
/// Active recognition sessions (gauge).
pub const SPEECH_SESSIONS_ACTIVE: &str = "speech_sessions_active";

/// Install the Prometheus metrics recorder (global).
///
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

pub fn record_error(category: &'static str) {
    metrics::counter!(WS_ERRORS_TOTAL, "category" => category).increment(1);
}

/// Periodically publishes the hub's connection and pending counts as gauges.
pub fn spawn_hub_observer(
    hub: Hub,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = hub.stats().await;
                    metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(stats.connections as f64);
                    metrics::gauge!(WS_PENDING_MESSAGES).set(stats.pending as f64);
                    debug!(connections = stats.connections, pending = stats.pending, "hub observed");
                }
            }
        }
    })
}
