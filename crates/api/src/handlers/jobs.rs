//! Handlers for the `/jobs` resource.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use conveyor_core::types::JobId;
use serde::Deserialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Submit a job of any registered type. Returns 201 with the `PENDING`
/// record; invalid input is rejected with 400 and creates nothing. A body
/// that is not a JSON submission is a 400 `BAD_REQUEST`.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = body?;
    let job = state
        .submitter
        .submit(&request.type_name, request.input)
        .await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

/// POST /api/v1/jobs/types/{type_name}
///
/// Submit a job of `type_name` with the request body as its input.
pub async fn submit_typed_job(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = body?;
    let job = state.submitter.submit(&type_name, input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Active (pending, started, in-progress) jobs, newest first.
pub async fn list_active_jobs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let jobs = state.status.list_active().await?;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/types
pub async fn list_job_types(State(state): State<AppState>) -> impl IntoResponse {
    Json(DataResponse {
        data: state.registry.type_names(),
    })
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.status.get_status(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel (also DELETE /api/v1/jobs/{id})
///
/// Pending jobs are revoked at once; running jobs are flagged and stop at
/// their next cancellation check; finished jobs are reported unchanged.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.cancellation.cancel(job_id).await?;
    tracing::info!(job_id = %job_id, state = %outcome.job().state, "Job cancel requested");
    Ok(Json(DataResponse { data: outcome }))
}
