//! Handlers for individual extraction tasks.

use axum::extract::{Path, State};
use axum::Json;
use quantimage_core::error::CoreError;
use quantimage_core::extraction::ExtractionTask;
use quantimage_core::features::FeatureMap;
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::handlers::access::find_owned_task;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TaskResult {
    pub task_id: DbId,
    pub study_uid: String,
    pub result_ref: String,
    pub features: FeatureMap,
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<ExtractionTask>>> {
    let (task, _) = find_owned_task(&state.ctx, id, &auth).await?;
    Ok(Json(DataResponse { data: task }))
}

/// GET /api/v1/tasks/{id}/result
///
/// Feature payload of a succeeded task; 404 until then.
pub async fn get_task_result(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<TaskResult>>> {
    let (task, _) = find_owned_task(&state.ctx, id, &auth).await?;

    let result_ref = match (task.state.status, task.state.result_ref) {
        (TaskStatus::Succeeded, Some(result_ref)) => result_ref,
        _ => {
            return Err(AppError::Core(CoreError::NotFound {
                entity: "Task result",
                id,
            }))
        }
    };
    let features = state.ctx.artifacts.read(&result_ref).await?;

    Ok(Json(DataResponse {
        data: TaskResult {
            task_id: task.id,
            study_uid: task.study_uid,
            result_ref,
            features,
        },
    }))
}
