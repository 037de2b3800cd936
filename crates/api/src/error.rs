use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quantimage_core::error::CoreError;
use quantimage_pipeline::artifacts::ArtifactError;
use quantimage_pipeline::{CreateJobError, FollowError, ScopeResolutionError, StoreError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce consistent `{ "error", "code" }`
/// JSON bodies. Internal failures are logged and replaced by a generic
/// message.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    CreateJob(#[from] CreateJobError),

    #[error(transparent)]
    Follow(#[from] FollowError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

type ErrorParts = (StatusCode, &'static str, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core(core),
            AppError::Store(err) => classify_store(err),

            AppError::CreateJob(err) => match err {
                CreateJobError::Invalid(core) => classify_core(core),
                CreateJobError::Scope(scope) => classify_scope(scope),
                CreateJobError::Store(store) => classify_store(store),
            },

            AppError::Follow(err) => match err {
                FollowError::Timeout { .. } => {
                    (StatusCode::REQUEST_TIMEOUT, "FOLLOW_TIMEOUT", err.to_string())
                }
                FollowError::Store(store) => classify_store(store),
                FollowError::BusClosed => internal(err),
            },

            AppError::Artifact(err) => classify_artifact(err),

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => internal(msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core(err: &CoreError) -> ErrorParts {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
        CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
        CoreError::Internal(msg) => internal(msg),
    }
}

fn classify_store(err: &StoreError) -> ErrorParts {
    match err {
        StoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        StoreError::Invalid(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        other => internal(other),
    }
}

fn classify_artifact(err: &ArtifactError) -> ErrorParts {
    match err {
        ArtifactError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(error = %err, "Task result file is missing");
            (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Task result not found".to_string(),
            )
        }
        other => internal(other),
    }
}

fn classify_scope(err: &ScopeResolutionError) -> ErrorParts {
    let message = match err {
        ScopeResolutionError::Catalog { source, .. } => format!("{err}: {source}"),
        ScopeResolutionError::Empty(_) => err.to_string(),
    };
    (StatusCode::UNPROCESSABLE_ENTITY, "SCOPE_RESOLUTION_ERROR", message)
}

fn internal(err: impl std::fmt::Display) -> ErrorParts {
    tracing::error!(error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
