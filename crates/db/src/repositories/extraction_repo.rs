//! Repository for the `extractions` table and the atomic creation of an
//! extraction together with its tasks.

use quantimage_core::extraction::{ExtractionScope, FeatureConfig};
use quantimage_core::status::{StatusId, TaskStatus};
use quantimage_core::types::DbId;
use sqlx::PgPool;

use crate::models::extraction::ExtractionRow;
use crate::models::task::TaskRow;
use crate::repositories::task_repo::COLUMNS as TASK_COLUMNS;

/// Column list for `extractions` queries.
const COLUMNS: &str = "id, owner, scope_kind, scope_ref, config, finalized_at, created_at";

/// Same columns qualified with the `e` alias for joins.
const QUALIFIED_COLUMNS: &str = "e.id, e.owner, e.scope_kind, e.scope_ref, e.config, \
    e.finalized_at, e.created_at";

/// Statuses of tasks that are still in flight.
const ACTIVE_STATUSES: [StatusId; 3] = [
    TaskStatus::Created as StatusId,
    TaskStatus::Queued as StatusId,
    TaskStatus::Running as StatusId,
];

/// Provides persistence operations for extractions.
pub struct ExtractionRepo;

impl ExtractionRepo {
    /// Insert an extraction and one `CREATED` task per study in a single
    /// transaction. Either everything is written or nothing is.
    pub async fn create_with_tasks(
        pool: &PgPool,
        owner: &str,
        scope: &ExtractionScope,
        config: &FeatureConfig,
        study_uids: &[String],
    ) -> Result<(ExtractionRow, Vec<TaskRow>), sqlx::Error> {
        let config_json = serde_json::to_value(config)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO extractions (owner, scope_kind, scope_ref, config) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        let extraction = sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(owner)
            .bind(scope.kind())
            .bind(scope.reference())
            .bind(&config_json)
            .fetch_one(&mut *tx)
            .await?;

        let task_query = format!(
            "INSERT INTO extraction_tasks (extraction_id, study_uid, status_id) \
             VALUES ($1, $2, $3) \
             RETURNING {TASK_COLUMNS}"
        );
        let mut tasks = Vec::with_capacity(study_uids.len());
        for study_uid in study_uids {
            let task = sqlx::query_as::<_, TaskRow>(&task_query)
                .bind(extraction.id)
                .bind(study_uid)
                .bind(TaskStatus::Created.id())
                .fetch_one(&mut *tx)
                .await?;
            tasks.push(task);
        }

        tx.commit().await?;

        tracing::debug!(
            extraction_id = extraction.id,
            task_count = tasks.len(),
            "Extraction created",
        );

        Ok((extraction, tasks))
    }

    /// Find an extraction by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<ExtractionRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM extractions WHERE id = $1");
        sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Extractions of `owner`, newest first.
    pub async fn list_by_owner(
        pool: &PgPool,
        owner: &str,
    ) -> Result<Vec<ExtractionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM extractions \
             WHERE owner = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(owner)
            .fetch_all(pool)
            .await
    }

    /// Find the newest extraction of `owner` for the same scope and an
    /// identical config that still has in-flight tasks.
    pub async fn find_active(
        pool: &PgPool,
        owner: &str,
        scope: &ExtractionScope,
        config: &FeatureConfig,
    ) -> Result<Option<ExtractionRow>, sqlx::Error> {
        let config_json = serde_json::to_value(config)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let query = format!(
            "SELECT {QUALIFIED_COLUMNS} FROM extractions e \
             WHERE e.owner = $1 AND e.scope_kind = $2 AND e.scope_ref = $3 \
               AND e.config = $4 \
               AND EXISTS ( \
                   SELECT 1 FROM extraction_tasks t \
                   WHERE t.extraction_id = e.id AND t.status_id = ANY($5) \
               ) \
             ORDER BY e.created_at DESC, e.id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(owner)
            .bind(scope.kind())
            .bind(scope.reference())
            .bind(&config_json)
            .bind(&ACTIVE_STATUSES[..])
            .fetch_optional(pool)
            .await
    }

    /// Newest extraction of `owner` with exactly this scope.
    pub async fn find_latest_by_owner_and_scope(
        pool: &PgPool,
        owner: &str,
        scope: &ExtractionScope,
    ) -> Result<Option<ExtractionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM extractions \
             WHERE owner = $1 AND scope_kind = $2 AND scope_ref = $3 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(owner)
            .bind(scope.kind())
            .bind(scope.reference())
            .fetch_optional(pool)
            .await
    }

    /// Newest extraction of `owner` that covers `study_uid`, whether it was
    /// a single-study or an album extraction.
    pub async fn find_latest_by_owner_and_study(
        pool: &PgPool,
        owner: &str,
        study_uid: &str,
    ) -> Result<Option<ExtractionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {QUALIFIED_COLUMNS} FROM extractions e \
             JOIN extraction_tasks t ON t.extraction_id = e.id \
             WHERE e.owner = $1 AND t.study_uid = $2 \
             ORDER BY t.created_at DESC, t.id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, ExtractionRow>(&query)
            .bind(owner)
            .bind(study_uid)
            .fetch_optional(pool)
            .await
    }

    /// Set `finalized_at` if it is still unset.
    ///
    /// Returns `true` only for the caller that performed the write, which
    /// makes concurrent finalize attempts safe.
    pub async fn mark_finalized(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE extractions SET finalized_at = NOW() \
             WHERE id = $1 AND finalized_at IS NULL",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
