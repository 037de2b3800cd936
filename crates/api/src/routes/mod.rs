pub mod extractions;
pub mod health;
pub mod tasks;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /extract/study/{study_uid}                       dispatch (POST)
/// /extract/album/{album_id}                        dispatch (POST)
///
/// /feature-families                                known feature families
///
/// /extractions                                     caller's extractions
/// /extractions/{id}                                extraction detail
/// /extractions/{id}/status                         aggregate status
/// /extractions/{id}/cancel                         cancel (POST)
/// /extractions/{id}/follow                         block until terminal
/// /extractions/study/{study_uid}                   latest for study
/// /extractions/album/{album_id}                    latest for album
///
/// /tasks/{id}                                      task detail
/// /tasks/{id}/result                               task features
///
/// /ws                                              WebSocket
/// ```
///
/// Every route except follow and the WebSocket upgrade is bounded by
/// `request_timeout`.
pub fn api_routes(request_timeout: Duration) -> Router<AppState> {
    Router::new()
        .merge(extractions::router())
        .merge(tasks::router())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .merge(extractions::follow_router())
        .route("/ws", get(ws::ws_handler))
}
