//! PostgreSQL implementation of the storage ports, delegating to the
//! repositories in `quantimage-db`.

use std::collections::HashMap;

use async_trait::async_trait;
use quantimage_core::extraction::{
    Extraction, ExtractionScope, ExtractionTask, FeatureConfig, TaskState,
};
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use quantimage_db::models::extraction::ExtractionRow;
use quantimage_db::models::task::{TaskRow, TaskTransition};
use quantimage_db::repositories::{ExtractionRepo, TaskRepo};
use quantimage_db::DbPool;

use crate::store::{
    allowed_sources, ExtractionStore, NewExtraction, StoreError, TaskStateReader, TaskStateStore,
};

fn to_extraction(row: ExtractionRow) -> Result<Extraction, StoreError> {
    Ok(Extraction::try_from(row)?)
}

fn to_task(row: TaskRow) -> Result<ExtractionTask, StoreError> {
    Ok(ExtractionTask::try_from(row)?)
}

fn to_state(row: Option<TaskRow>) -> Result<Option<TaskState>, StoreError> {
    row.map(|r| r.state().map_err(StoreError::from)).transpose()
}

// ---------------------------------------------------------------------------
// Extractions
// ---------------------------------------------------------------------------

pub struct PgExtractionStore {
    pool: DbPool,
}

impl PgExtractionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExtractionStore for PgExtractionStore {
    async fn create_with_tasks(
        &self,
        new: NewExtraction,
    ) -> Result<(Extraction, Vec<ExtractionTask>), StoreError> {
        if new.study_uids.is_empty() {
            return Err(StoreError::Invalid(
                "An extraction must have at least one task".to_string(),
            ));
        }
        let (row, task_rows) = ExtractionRepo::create_with_tasks(
            &self.pool,
            &new.owner,
            &new.scope,
            &new.config,
            &new.study_uids,
        )
        .await?;

        let tasks = task_rows
            .into_iter()
            .map(to_task)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((to_extraction(row)?, tasks))
    }

    async fn find(&self, id: DbId) -> Result<Option<Extraction>, StoreError> {
        ExtractionRepo::find_by_id(&self.pool, id)
            .await?
            .map(to_extraction)
            .transpose()
    }

    async fn list_tasks(&self, extraction_id: DbId) -> Result<Vec<ExtractionTask>, StoreError> {
        TaskRepo::list_by_extraction(&self.pool, extraction_id)
            .await?
            .into_iter()
            .map(to_task)
            .collect()
    }

    async fn find_task(&self, task_id: DbId) -> Result<Option<ExtractionTask>, StoreError> {
        TaskRepo::find_by_id(&self.pool, task_id)
            .await?
            .map(to_task)
            .transpose()
    }

    async fn list_unfinished_tasks(&self) -> Result<Vec<ExtractionTask>, StoreError> {
        TaskRepo::list_unfinished(&self.pool)
            .await?
            .into_iter()
            .map(to_task)
            .collect()
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Extraction>, StoreError> {
        ExtractionRepo::list_by_owner(&self.pool, owner)
            .await?
            .into_iter()
            .map(to_extraction)
            .collect()
    }

    async fn find_active(
        &self,
        owner: &str,
        scope: &ExtractionScope,
        config: &FeatureConfig,
    ) -> Result<Option<Extraction>, StoreError> {
        ExtractionRepo::find_active(&self.pool, owner, scope, config)
            .await?
            .map(to_extraction)
            .transpose()
    }

    async fn latest_for_scope(
        &self,
        owner: &str,
        scope: &ExtractionScope,
    ) -> Result<Option<Extraction>, StoreError> {
        ExtractionRepo::find_latest_by_owner_and_scope(&self.pool, owner, scope)
            .await?
            .map(to_extraction)
            .transpose()
    }

    async fn latest_for_study(
        &self,
        owner: &str,
        study_uid: &str,
    ) -> Result<Option<Extraction>, StoreError> {
        ExtractionRepo::find_latest_by_owner_and_study(&self.pool, owner, study_uid)
            .await?
            .map(to_extraction)
            .transpose()
    }

    async fn mark_finalized(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(ExtractionRepo::mark_finalized(&self.pool, id).await?)
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

pub struct PgTaskStateStore {
    pool: DbPool,
}

impl PgTaskStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStateReader for PgTaskStateStore {
    async fn get(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        to_state(TaskRepo::find_by_id(&self.pool, task_id).await?)
    }

    async fn get_many(&self, task_ids: &[DbId]) -> Result<HashMap<DbId, TaskState>, StoreError> {
        TaskRepo::find_many(&self.pool, task_ids)
            .await?
            .into_iter()
            .map(|row| -> Result<(DbId, TaskState), StoreError> { Ok((row.id, row.state()?)) })
            .collect()
    }
}

#[async_trait]
impl TaskStateStore for PgTaskStateStore {
    async fn mark_queued(
        &self,
        task_id: DbId,
        token: &str,
    ) -> Result<Option<TaskState>, StoreError> {
        to_state(TaskRepo::mark_queued(&self.pool, task_id, token).await?)
    }

    async fn transition(
        &self,
        task_id: DbId,
        from: &[TaskStatus],
        transition: TaskTransition,
    ) -> Result<Option<TaskState>, StoreError> {
        let allowed = allowed_sources(from, transition.to);
        if allowed.is_empty() {
            return Ok(None);
        }
        to_state(TaskRepo::transition(&self.pool, task_id, &allowed, &transition).await?)
    }

    async fn request_cancel(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        to_state(TaskRepo::request_cancel(&self.pool, task_id).await?)
    }

    async fn is_cancel_requested(&self, task_id: DbId) -> Result<bool, StoreError> {
        Ok(TaskRepo::is_cancel_requested(&self.pool, task_id).await?)
    }
}
