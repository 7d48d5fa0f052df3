pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /jobs    job submission, status and cancellation
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/jobs", jobs::router())
}
