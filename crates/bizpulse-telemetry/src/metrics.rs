//! Prometheus recorder and metric names shared by the relay crates.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections accepted total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open, authenticated WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections closed with 1008 (counter).
pub const WS_AUTH_FAILURES_TOTAL: &str = "ws_auth_failures_total";
/// Upgrades refused because the connection cap was reached (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Lifetime of an authenticated connection (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Events published on the bus (counter, labels: kind).
pub const BUS_EVENTS_PUBLISHED_TOTAL: &str = "bus_events_published_total";
/// Listener calls that returned an error or panicked (counter, labels: kind).
pub const BUS_LISTENER_FAILURES_TOTAL: &str = "bus_listener_failures_total";
/// Frames enqueued to connections by fan-out (counter).
pub const FANOUT_DELIVERIES_TOTAL: &str = "fanout_deliveries_total";
/// Frames dropped because a send queue was full or closed (counter).
pub const FANOUT_DROPS_TOTAL: &str = "fanout_drops_total";
