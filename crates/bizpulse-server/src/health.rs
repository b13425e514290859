//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub uptime_secs: u64,
    /// Open dashboard connections across all businesses.
    pub connections: usize,
    /// Businesses with at least one open connection.
    pub businesses: usize,
}

pub fn health_check(start_time: Instant, connections: usize, businesses: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        businesses,
    }
}
