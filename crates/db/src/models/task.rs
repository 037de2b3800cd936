//! Row model for the `extraction_tasks` table.

use quantimage_core::error::CoreError;
use quantimage_core::extraction::{ExtractionTask, TaskError, TaskProgress, TaskState};
use quantimage_core::status::{StatusId, TaskStatus};
use quantimage_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `extraction_tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: DbId,
    pub extraction_id: DbId,
    pub study_uid: String,
    pub external_job_token: Option<String>,
    pub status_id: StatusId,
    pub progress_current: Option<i32>,
    pub progress_total: Option<i32>,
    pub progress_message: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TaskRow {
    /// Decode the state columns into a [`TaskState`].
    pub fn state(&self) -> Result<TaskState, CoreError> {
        let status = TaskStatus::from_id(self.status_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "Task {} has unknown status id {}",
                self.id, self.status_id
            ))
        })?;

        let progress = match (self.progress_current, self.progress_total) {
            (Some(current), Some(total)) => Some(TaskProgress::new(
                u32::try_from(current).unwrap_or(0),
                u32::try_from(total).unwrap_or(0),
                self.progress_message.clone().unwrap_or_default(),
            )),
            _ => None,
        };

        let error = match &self.error {
            Some(value) => Some(serde_json::from_value::<TaskError>(value.clone()).map_err(|e| {
                CoreError::Internal(format!("Task {} has malformed error detail: {e}", self.id))
            })?),
            None => None,
        };

        Ok(TaskState {
            status,
            progress,
            result_ref: self.result_ref.clone(),
            error,
            cancel_requested: self.cancel_requested,
            updated_at: self.updated_at,
        })
    }
}

impl TryFrom<TaskRow> for ExtractionTask {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let state = row.state()?;
        Ok(ExtractionTask {
            id: row.id,
            extraction_id: row.extraction_id,
            study_uid: row.study_uid,
            external_job_token: row.external_job_token,
            state,
            created_at: row.created_at,
        })
    }
}

/// Column values written by a status transition.
///
/// Every transition rewrites the full state so a terminal write clears
/// stale progress and a progress write never carries an error.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub to: TaskStatus,
    pub progress: Option<TaskProgress>,
    pub result_ref: Option<String>,
    pub error: Option<TaskError>,
    /// Clear `external_job_token`: the work queue never accepted the task.
    pub release_token: bool,
}

impl TaskTransition {
    /// Progress checkpoint while `RUNNING`.
    pub fn running(progress: TaskProgress) -> Self {
        Self {
            to: TaskStatus::Running,
            progress: Some(progress),
            result_ref: None,
            error: None,
            release_token: false,
        }
    }

    pub fn succeeded(result_ref: impl Into<String>) -> Self {
        Self {
            to: TaskStatus::Succeeded,
            progress: None,
            result_ref: Some(result_ref.into()),
            error: None,
            release_token: false,
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            to: TaskStatus::Failed,
            progress: None,
            result_ref: None,
            error: Some(error),
            release_token: false,
        }
    }

    /// Failure of a task the work queue refused. The token recorded for
    /// the attempt is dropped with it.
    pub fn rejected(error: TaskError) -> Self {
        Self {
            release_token: true,
            ..Self::failed(error)
        }
    }
}
