//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle whose recorder is not installed globally. `/metrics` renders
/// empty; used when the embedding process owns the global recorder.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused because of the connection cap (counter).
pub const WS_CONNECTIONS_REFUSED_TOTAL: &str = "ws_connections_refused_total";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Authenticated sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Handshakes rejected total (counter, labels: reason).
pub const AUTH_REJECTED_TOTAL: &str = "auth_rejected_total";
/// Subscribe attempts refused total (counter).
pub const SUBSCRIBE_DENIED_TOTAL: &str = "subscribe_denied_total";
/// Facts ingested by the broker (counter, labels: type).
pub const FACTS_INGESTED_TOTAL: &str = "facts_ingested_total";
/// Facts skipped as duplicates (counter).
pub const FACTS_DUPLICATE_TOTAL: &str = "facts_duplicate_total";
/// Envelopes queued to sessions (counter).
pub const ENVELOPES_PUSHED_TOTAL: &str = "envelopes_pushed_total";
/// Envelopes dropped for closed sessions (counter).
pub const ENVELOPES_DROPPED_TOTAL: &str = "envelopes_dropped_total";
/// Sessions evicted (counter, labels: reason).
pub const SESSIONS_EVICTED_TOTAL: &str = "sessions_evicted_total";
/// Replay requests (counter, labels: outcome).
pub const REPLAY_REQUESTS_TOTAL: &str = "replay_requests_total";
/// Change feed lag events (counter).
pub const FEED_LAGGED_TOTAL: &str = "feed_lagged_total";
