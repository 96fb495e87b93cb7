//! Health and version endpoints
//!
//! Operational introspection for monitoring and load balancers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::handlers::AppState;
use crate::metrics::MetricsSnapshot;
use crate::pool::PoolStats;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "shutting_down" once the pool has been closed
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub requests: MetricsSnapshot,
    /// One entry per (model, workspace) key seen so far
    pub pools: Vec<PoolStats>,
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

/// GET /health handler
///
/// Returns 200 while serving and 503 after shutdown has started.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status_code, status) = if state.pool().is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status_code,
        Json(HealthResponse {
            status,
            uptime_seconds: state.uptime().as_secs(),
            requests: state.metrics().snapshot(),
            pools: state.pool().stats(),
        }),
    )
}

/// GET /version handler
pub async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
