//! Handlers for extraction dispatch, status, cancellation and follow.
//!
//! All endpoints require a caller identity via [`AuthUser`]; callers only
//! see their own extractions.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use quantimage_core::aggregation::{aggregate, JobStatusReport, TaskSnapshot};
use quantimage_core::extraction::{
    Extraction, ExtractionScope, ExtractionTask, FeatureConfig, KNOWN_FEATURE_FAMILIES,
};
use quantimage_core::types::DbId;
use quantimage_pipeline::{follow_job, CancelOutcome, DispatchRequest, ExtractionContext};
use serde::Serialize;

use crate::error::AppResult;
use crate::handlers::access::find_owned_extraction;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Result of a dispatch request.
#[derive(Debug, Serialize)]
pub struct DispatchView {
    pub extraction: Extraction,
    pub tasks: Vec<ExtractionTask>,
    /// `true` when an in-flight extraction was returned.
    pub reused: bool,
}

/// An extraction with the current state of each task and its aggregate.
#[derive(Debug, Serialize)]
pub struct ExtractionView {
    pub extraction: Extraction,
    pub tasks: Vec<TaskSnapshot>,
    pub status: JobStatusReport,
}

/// An extraction with its aggregate status, as listed per owner.
#[derive(Debug, Serialize)]
pub struct ExtractionSummary {
    pub extraction: Extraction,
    pub status: JobStatusReport,
}

async fn extraction_view(ctx: &ExtractionContext, extraction: Extraction) -> AppResult<ExtractionView> {
    let tasks = ctx.aggregator.snapshots(extraction.id).await?;
    let status = aggregate(extraction.id, &tasks);
    Ok(ExtractionView {
        extraction,
        tasks,
        status,
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(
    state: &AppState,
    auth: AuthUser,
    scope: ExtractionScope,
    config: FeatureConfig,
) -> AppResult<impl IntoResponse> {
    let outcome = state
        .ctx
        .dispatcher
        .dispatch(DispatchRequest {
            owner: auth.user_id,
            scope,
            config,
        })
        .await?;

    let status = if outcome.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(DataResponse {
            data: DispatchView {
                extraction: outcome.extraction,
                tasks: outcome.tasks,
                reused: outcome.reused,
            },
        }),
    ))
}

/// POST /api/v1/extract/study/{study_uid}
///
/// Body: `{ "families": { "<family>": { ...config } } }`. Returns 201 with
/// the new extraction, or 200 when an in-flight one was reused.
pub async fn extract_study(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(study_uid): Path<String>,
    Json(config): Json<FeatureConfig>,
) -> AppResult<impl IntoResponse> {
    dispatch(&state, auth, ExtractionScope::Study { study_uid }, config).await
}

/// POST /api/v1/extract/album/{album_id}
pub async fn extract_album(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(album_id): Path<String>,
    Json(config): Json<FeatureConfig>,
) -> AppResult<impl IntoResponse> {
    dispatch(&state, auth, ExtractionScope::Album { album_id }, config).await
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/feature-families
///
/// Feature families a request may name.
pub async fn list_feature_families(_auth: AuthUser) -> Json<DataResponse<Vec<&'static str>>> {
    Json(DataResponse {
        data: KNOWN_FEATURE_FAMILIES.to_vec(),
    })
}

/// GET /api/v1/extractions
///
/// The caller's extractions, newest first.
pub async fn list_extractions(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<ExtractionSummary>>>> {
    let extractions = state.ctx.extractions.list_for_owner(&auth.user_id).await?;

    let mut summaries = Vec::with_capacity(extractions.len());
    for extraction in extractions {
        let status = state.ctx.aggregator.job_status(extraction.id).await?;
        summaries.push(ExtractionSummary { extraction, status });
    }
    Ok(Json(DataResponse { data: summaries }))
}

/// GET /api/v1/extractions/{id}
pub async fn get_extraction(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<ExtractionView>>> {
    let extraction = find_owned_extraction(&state.ctx, id, &auth).await?;
    let view = extraction_view(&state.ctx, extraction).await?;
    Ok(Json(DataResponse { data: view }))
}

/// GET /api/v1/extractions/{id}/status
pub async fn get_status(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<JobStatusReport>>> {
    find_owned_extraction(&state.ctx, id, &auth).await?;
    let report = state.ctx.aggregator.job_status(id).await?;
    Ok(Json(DataResponse { data: report }))
}

/// GET /api/v1/extractions/study/{study_uid}
///
/// Newest extraction of the caller covering the study, or `null`.
pub async fn latest_for_study(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(study_uid): Path<String>,
) -> AppResult<Json<DataResponse<Option<ExtractionView>>>> {
    let latest = state
        .ctx
        .extractions
        .latest_for_study(&auth.user_id, &study_uid)
        .await?;
    let view = match latest {
        Some(extraction) => Some(extraction_view(&state.ctx, extraction).await?),
        None => None,
    };
    Ok(Json(DataResponse { data: view }))
}

/// GET /api/v1/extractions/album/{album_id}
pub async fn latest_for_album(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(album_id): Path<String>,
) -> AppResult<Json<DataResponse<Option<ExtractionView>>>> {
    let scope = ExtractionScope::Album { album_id };
    let latest = state
        .ctx
        .extractions
        .latest_for_scope(&auth.user_id, &scope)
        .await?;
    let view = match latest {
        Some(extraction) => Some(extraction_view(&state.ctx, extraction).await?),
        None => None,
    };
    Ok(Json(DataResponse { data: view }))
}

// ---------------------------------------------------------------------------
// Cancel / follow
// ---------------------------------------------------------------------------

/// POST /api/v1/extractions/{id}/cancel
pub async fn cancel_extraction(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<CancelOutcome>>> {
    find_owned_extraction(&state.ctx, id, &auth).await?;
    let outcome = state.ctx.dispatcher.cancel(id).await?;

    tracing::info!(
        job_id = id,
        user_id = %auth.user_id,
        cancelled = outcome.cancelled,
        signalled = outcome.signalled,
        "Extraction cancelled by user",
    );

    Ok(Json(DataResponse { data: outcome }))
}

/// GET /api/v1/extractions/{id}/follow
///
/// Blocks until the extraction is terminal and returns the final report.
/// Responds 408 after `FOLLOW_TIMEOUT_SECS`; a client disconnect drops the
/// follow.
pub async fn follow_extraction(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<JobStatusReport>>> {
    find_owned_extraction(&state.ctx, id, &auth).await?;
    let timeout = Duration::from_secs(state.config.follow_timeout_secs);
    let report = follow_job(&state.ctx.aggregator, &state.ctx.bus, id, timeout).await?;
    Ok(Json(DataResponse { data: report }))
}
