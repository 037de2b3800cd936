use axum::routing::{get, post};
use axum::Router;

use crate::handlers::extractions;
use crate::state::AppState;

/// Extraction routes subject to the request timeout.
///
/// ```text
/// POST   /extract/study/{study_uid}        dispatch a single-study extraction
/// POST   /extract/album/{album_id}         dispatch an album extraction
/// GET    /feature-families                 known feature families
/// GET    /extractions                      caller's extractions, newest first
/// GET    /extractions/{id}                 extraction, task snapshots, status
/// GET    /extractions/{id}/status          aggregate status
/// POST   /extractions/{id}/cancel          cancel remaining tasks
/// GET    /extractions/study/{study_uid}    latest extraction covering a study
/// GET    /extractions/album/{album_id}     latest album extraction
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/extract/study/{study_uid}", post(extractions::extract_study))
        .route("/extract/album/{album_id}", post(extractions::extract_album))
        .route("/feature-families", get(extractions::list_feature_families))
        .route("/extractions", get(extractions::list_extractions))
        .route("/extractions/{id}", get(extractions::get_extraction))
        .route("/extractions/{id}/status", get(extractions::get_status))
        .route("/extractions/{id}/cancel", post(extractions::cancel_extraction))
        .route(
            "/extractions/study/{study_uid}",
            get(extractions::latest_for_study),
        )
        .route(
            "/extractions/album/{album_id}",
            get(extractions::latest_for_album),
        )
}

/// Long-lived follow route; mounted outside the request timeout.
pub fn follow_router() -> Router<AppState> {
    Router::new().route(
        "/extractions/{id}/follow",
        get(extractions::follow_extraction),
    )
}
