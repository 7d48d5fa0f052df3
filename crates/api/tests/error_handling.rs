//! Tests for `AppError` → HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no server needed.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use conveyor_api::error::AppError;
use conveyor_core::error::CoreError;
use conveyor_core::job::JobState;
use http_body_util::BodyExt;
use uuid::Uuid;

/// Helper: convert an `AppError` into its status code and parsed JSON body.
async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn not_found_error_returns_404() {
    let id = Uuid::nil();
    let (status, json) = error_to_response(CoreError::job_not_found(id).into()).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], format!("Job with id {id} not found"));
}

#[tokio::test]
async fn validation_error_returns_400() {
    let err = CoreError::Validation("operation: unknown variant `divide`".into());
    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["error"], "operation: unknown variant `divide`");
}

#[tokio::test]
async fn bad_request_error_returns_400() {
    let (status, json) = error_to_response(AppError::BadRequest("invalid field value".into())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "invalid field value");
}

#[tokio::test]
async fn illegal_transition_returns_409() {
    let err = CoreError::IllegalTransition {
        id: Uuid::nil(),
        from: JobState::Success,
        to: JobState::Started,
    };
    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "ILLEGAL_TRANSITION");
}

#[tokio::test]
async fn store_unavailable_returns_503_and_hides_details() {
    let err = CoreError::StoreUnavailable("connection refused at 10.0.0.5:5432".into());
    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "STORE_UNAVAILABLE");
    assert!(!json["error"].as_str().unwrap().contains("10.0.0.5"));
}

#[tokio::test]
async fn broker_unavailable_returns_503() {
    let err = CoreError::BrokerUnavailable("queue down".into());
    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "BROKER_UNAVAILABLE");
}

#[tokio::test]
async fn internal_error_returns_500_and_sanitizes_message() {
    let err = CoreError::Internal("secret database credentials leaked".into());
    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert!(
        !json["error"].as_str().unwrap().contains("secret"),
        "Internal error details must not leak to clients"
    );
}
