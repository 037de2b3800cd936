//! Tests for `AppError` → HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no server is
//! needed.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use quantimage_api::error::AppError;
use quantimage_core::error::CoreError;
use quantimage_pipeline::artifacts::ArtifactError;
use quantimage_pipeline::catalog::CatalogError;
use quantimage_pipeline::{CreateJobError, FollowError, ScopeResolutionError, StoreError};

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
    let err = AppError::Core(CoreError::NotFound {
        entity: "Extraction",
        id: 42,
    });

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "Extraction with id 42 not found");
}

#[tokio::test]
async fn forbidden_error_returns_403() {
    let err = AppError::Core(CoreError::Forbidden("not your extraction".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "FORBIDDEN");
}

#[tokio::test]
async fn invalid_config_returns_400() {
    let err = AppError::CreateJob(CreateJobError::Invalid(CoreError::Validation(
        "Unknown feature family 'foo'".into(),
    )));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["error"], "Unknown feature family 'foo'");
}

#[tokio::test]
async fn scope_resolution_returns_422_with_cause() {
    let err = AppError::CreateJob(CreateJobError::Scope(ScopeResolutionError::Catalog {
        album_id: "lung".into(),
        source: CatalogError::UnknownAlbum("lung".into()),
    }));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "SCOPE_RESOLUTION_ERROR");
    assert!(json["error"].as_str().unwrap().starts_with("Failed to resolve album 'lung'"));
}

#[tokio::test]
async fn follow_timeout_returns_408() {
    let err = AppError::Follow(FollowError::Timeout {
        job_id: 3,
        timeout: Duration::from_secs(1),
    });

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(json["code"], "FOLLOW_TIMEOUT");
}

#[tokio::test]
async fn store_failures_are_sanitized() {
    let err = AppError::Store(StoreError::Corrupt("task 9 has status id 42".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert_eq!(json["error"], "An internal error occurred");
}

#[tokio::test]
async fn bad_request_error_returns_400() {
    let err = AppError::BadRequest("invalid field value".into());

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "invalid field value");
}

#[tokio::test]
async fn missing_artifact_returns_404() {
    let err = AppError::Artifact(ArtifactError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "No such file or directory",
    )));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn unreadable_artifact_returns_500() {
    let err = AppError::Artifact(ArtifactError::Io(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "Permission denied",
    )));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
}
