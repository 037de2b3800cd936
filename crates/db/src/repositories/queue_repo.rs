//! Repository for the `task_queue` table, the durable work queue shared by
//! the API and worker processes.
//!
//! A claim is a lease: the claiming worker renews `claimed_at` while the
//! invocation runs, and claims that stop being renewed are released so
//! the task can be recovered.

use std::time::Duration;

use quantimage_core::types::DbId;
use sqlx::PgPool;

use crate::models::queue::QueueEntry;

/// Column list for `task_queue` queries.
const COLUMNS: &str = "\
    id, token, task_id, payload, enqueued_at, claimed_at, claimed_by, completed_at";

/// Provides enqueue/claim operations for queued task invocations.
pub struct QueueRepo;

impl QueueRepo {
    /// Append an invocation for `task_id` under `token`, the external job
    /// token already recorded on the task.
    ///
    /// Enqueueing a token that is already present puts that entry back in
    /// line as unclaimed, which is how lost invocations are resubmitted.
    pub async fn enqueue(
        pool: &PgPool,
        token: &str,
        task_id: DbId,
        payload: &serde_json::Value,
    ) -> Result<QueueEntry, sqlx::Error> {
        let query = format!(
            "INSERT INTO task_queue (token, task_id, payload) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (token) DO UPDATE \
             SET payload = EXCLUDED.payload, enqueued_at = NOW(), \
                 claimed_at = NULL, claimed_by = NULL, completed_at = NULL \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntry>(&query)
            .bind(token)
            .bind(task_id)
            .bind(payload)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest unclaimed entry for a worker.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same entry.
    pub async fn claim_next(
        pool: &PgPool,
        worker_name: &str,
    ) -> Result<Option<QueueEntry>, sqlx::Error> {
        let query = format!(
            "UPDATE task_queue \
             SET claimed_at = NOW(), claimed_by = $1 \
             WHERE id = ( \
                 SELECT id FROM task_queue \
                 WHERE claimed_at IS NULL \
                 ORDER BY enqueued_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntry>(&query)
            .bind(worker_name)
            .fetch_optional(pool)
            .await
    }

    /// Mark a claimed entry as processed.
    pub async fn complete(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE task_queue SET completed_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Push the lease of a claimed entry forward. Returns `false` if the
    /// entry is no longer claimed by `worker_name`.
    pub async fn renew(pool: &PgPool, id: DbId, worker_name: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE task_queue SET claimed_at = NOW() \
             WHERE id = $1 AND claimed_by = $2 AND completed_at IS NULL",
        )
        .bind(id)
        .bind(worker_name)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close claims whose lease was not renewed within `lease` and return
    /// them. Their workers are presumed dead; the caller recovers the tasks.
    pub async fn release_stale(
        pool: &PgPool,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, sqlx::Error> {
        let query = format!(
            "UPDATE task_queue SET completed_at = NOW() \
             WHERE claimed_at IS NOT NULL AND completed_at IS NULL \
               AND claimed_at < NOW() - make_interval(secs => $1) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntry>(&query)
            .bind(lease.as_secs_f64())
            .fetch_all(pool)
            .await
    }

    /// Delete entries completed more than `retention` ago. Returns the
    /// number of rows removed.
    pub async fn prune_completed(pool: &PgPool, retention: Duration) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM task_queue \
             WHERE completed_at IS NOT NULL \
               AND completed_at < NOW() - make_interval(secs => $1)",
        )
        .bind(retention.as_secs_f64())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Whether a task has an entry that is waiting or being processed.
    pub async fn has_live_entry(pool: &PgPool, task_id: DbId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS (\
                 SELECT 1 FROM task_queue WHERE task_id = $1 AND completed_at IS NULL\
             )",
        )
        .bind(task_id)
        .fetch_one(pool)
        .await
    }

    /// Drop unclaimed entries for a task. Returns `true` if any were removed.
    pub async fn remove_unclaimed(pool: &PgPool, task_id: DbId) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM task_queue WHERE task_id = $1 AND claimed_at IS NULL")
                .bind(task_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
