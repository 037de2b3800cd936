use axum::routing::get;
use axum::Router;

use crate::handlers::tasks;
use crate::state::AppState;

/// ```text
/// GET    /tasks/{id}           task with current state
/// GET    /tasks/{id}/result    feature payload of a succeeded task
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/result", get(tasks::get_task_result))
}
