//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                    -> list_active_jobs
/// POST   /                    -> submit_job
/// GET    /types               -> list_job_types
/// POST   /types/{type_name}   -> submit_typed_job
/// GET    /{id}                -> get_job
/// DELETE /{id}                -> cancel_job
/// POST   /{id}/cancel         -> cancel_job
/// GET    /{id}/ws             -> status stream (WebSocket)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_active_jobs).post(jobs::submit_job))
        .route("/types", get(jobs::list_job_types))
        .route("/types/{type_name}", post(jobs::submit_typed_job))
        .route("/{id}", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/{id}/cancel", post(jobs::cancel_job))
        .route("/{id}/ws", get(ws::status_stream_handler))
}
