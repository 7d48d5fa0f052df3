use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the job store is reachable.
    pub store_healthy: bool,
    /// Messages waiting or in flight, when the broker answers.
    pub queue_depth: Option<usize>,
}

/// GET /health -- returns service, store and queue health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = state.store.health_check().await.is_ok();
    let queue_depth = state.broker.depth().await.ok();

    let status = if store_healthy && queue_depth.is_some() {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store_healthy,
        queue_depth,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
