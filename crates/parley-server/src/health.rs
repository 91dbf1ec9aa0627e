//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once the hub refuses new subscribes.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Cached sessions of every transport.
    pub sessions: usize,
    /// Running topic actors.
    pub topics: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, shutting_down: bool, sessions: usize, topics: usize) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        topics,
    }
}
