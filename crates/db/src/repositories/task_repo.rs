//! Repository for the `extraction_tasks` table.
//!
//! Every status write is a conditional update guarded by the set of
//! statuses it may start from, so terminal rows can never be rewritten and
//! concurrent writers cannot race a read-modify-write. `updated_at` is
//! bumped strictly monotonically per row.

use quantimage_core::status::{StatusId, TaskStatus};
use quantimage_core::types::DbId;
use sqlx::PgPool;

use crate::models::task::{TaskRow, TaskTransition};

/// Column list for `extraction_tasks` queries.
pub(crate) const COLUMNS: &str = "\
    id, extraction_id, study_uid, external_job_token, status_id, \
    progress_current, progress_total, progress_message, \
    result_ref, error, cancel_requested, created_at, updated_at";

/// Strictly increasing timestamp expression for updates.
const NEXT_UPDATED_AT: &str = "GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')";

/// Terminal statuses: succeeded, failed.
const TERMINAL_STATUSES: [StatusId; 2] = [
    TaskStatus::Succeeded as StatusId,
    TaskStatus::Failed as StatusId,
];

/// Provides persistence operations for extraction tasks.
pub struct TaskRepo;

impl TaskRepo {
    /// Find a task by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM extraction_tasks WHERE id = $1");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Fetch several tasks at once. Missing IDs are simply absent.
    pub async fn find_many(pool: &PgPool, ids: &[DbId]) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM extraction_tasks WHERE id = ANY($1) ORDER BY id");
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(ids)
            .fetch_all(pool)
            .await
    }

    /// All tasks of an extraction, in creation order.
    pub async fn list_by_extraction(
        pool: &PgPool,
        extraction_id: DbId,
    ) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM extraction_tasks WHERE extraction_id = $1 ORDER BY id"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(extraction_id)
            .fetch_all(pool)
            .await
    }

    /// Every non-terminal task, oldest first.
    pub async fn list_unfinished(pool: &PgPool) -> Result<Vec<TaskRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM extraction_tasks \
             WHERE status_id NOT IN ($1, $2) \
             ORDER BY id"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(TERMINAL_STATUSES[0])
            .bind(TERMINAL_STATUSES[1])
            .fetch_all(pool)
            .await
    }

    /// Record the work-queue token and move `CREATED -> QUEUED`.
    ///
    /// Returns `None` if the task was no longer `CREATED` (for example it
    /// was cancelled while the extraction was being fanned out).
    pub async fn mark_queued(
        pool: &PgPool,
        id: DbId,
        token: &str,
    ) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!(
            "UPDATE extraction_tasks \
             SET status_id = $2, external_job_token = $3, updated_at = {NEXT_UPDATED_AT} \
             WHERE id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .bind(TaskStatus::Queued.id())
            .bind(token)
            .bind(TaskStatus::Created.id())
            .fetch_optional(pool)
            .await
    }

    /// Apply a transition if the task is currently in one of `from`.
    ///
    /// Returns the updated row, or `None` when the guard did not match.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: &[TaskStatus],
        transition: &TaskTransition,
    ) -> Result<Option<TaskRow>, sqlx::Error> {
        let from_ids: Vec<StatusId> = from
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.id())
            .collect();

        let error_json = transition
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let (current, total, message) = match &transition.progress {
            Some(p) => (
                Some(i32::try_from(p.current_step).unwrap_or(i32::MAX)),
                Some(i32::try_from(p.total_steps).unwrap_or(i32::MAX)),
                Some(p.message.as_str()),
            ),
            None => (None, None, None),
        };

        let query = format!(
            "UPDATE extraction_tasks \
             SET status_id = $2, progress_current = $3, progress_total = $4, \
                 progress_message = $5, result_ref = $6, error = $7, \
                 external_job_token = CASE WHEN $9 THEN NULL ELSE external_job_token END, \
                 updated_at = {NEXT_UPDATED_AT} \
             WHERE id = $1 AND status_id = ANY($8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .bind(transition.to.id())
            .bind(current)
            .bind(total)
            .bind(message)
            .bind(transition.result_ref.as_deref())
            .bind(error_json)
            .bind(&from_ids)
            .bind(transition.release_token)
            .fetch_optional(pool)
            .await
    }

    /// Raise the cooperative cancellation flag on a non-terminal task.
    pub async fn request_cancel(pool: &PgPool, id: DbId) -> Result<Option<TaskRow>, sqlx::Error> {
        let query = format!(
            "UPDATE extraction_tasks SET cancel_requested = TRUE \
             WHERE id = $1 AND status_id NOT IN ($2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .bind(TERMINAL_STATUSES[0])
            .bind(TERMINAL_STATUSES[1])
            .fetch_optional(pool)
            .await
    }

    /// Read only the cancellation flag.
    pub async fn is_cancel_requested(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM extraction_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }
}
