//! Storage ports for extractions and task state.
//!
//! [`ExtractionStore`] owns extraction records and task membership.
//! [`TaskStateReader`] and [`TaskStateStore`] split task state access so
//! readers (the aggregator, polling clients) can be pointed at a remote
//! status service while writers always go to the primary store.

use std::collections::HashMap;

use async_trait::async_trait;
use quantimage_core::error::CoreError;
use quantimage_core::extraction::{
    Extraction, ExtractionScope, ExtractionTask, FeatureConfig, TaskState,
};
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use quantimage_db::models::task::TaskTransition;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Status service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Status service returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Invalid extraction: {0}")]
    Invalid(String),
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => StoreError::NotFound { entity, id },
            CoreError::Validation(msg) => StoreError::Invalid(msg),
            other => StoreError::Corrupt(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction store
// ---------------------------------------------------------------------------

/// Everything needed to create an extraction and its tasks.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub owner: String,
    pub scope: ExtractionScope,
    pub config: FeatureConfig,
    /// Resolved, de-duplicated study UIDs. Must not be empty.
    pub study_uids: Vec<String>,
}

#[async_trait]
pub trait ExtractionStore: Send + Sync {
    /// Create the extraction and one `CREATED` task per study atomically.
    async fn create_with_tasks(
        &self,
        new: NewExtraction,
    ) -> Result<(Extraction, Vec<ExtractionTask>), StoreError>;

    async fn find(&self, id: DbId) -> Result<Option<Extraction>, StoreError>;

    /// Tasks of an extraction in creation order.
    async fn list_tasks(&self, extraction_id: DbId) -> Result<Vec<ExtractionTask>, StoreError>;

    async fn find_task(&self, task_id: DbId) -> Result<Option<ExtractionTask>, StoreError>;

    /// Every task not yet terminal, across all extractions, oldest first.
    async fn list_unfinished_tasks(&self) -> Result<Vec<ExtractionTask>, StoreError>;

    /// Extractions of `owner`, newest first.
    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Extraction>, StoreError>;

    /// Newest extraction of `owner` with the same scope and config that
    /// still has a non-terminal task.
    async fn find_active(
        &self,
        owner: &str,
        scope: &ExtractionScope,
        config: &FeatureConfig,
    ) -> Result<Option<Extraction>, StoreError>;

    async fn latest_for_scope(
        &self,
        owner: &str,
        scope: &ExtractionScope,
    ) -> Result<Option<Extraction>, StoreError>;

    /// Newest extraction of `owner` covering `study_uid`, in any scope.
    async fn latest_for_study(
        &self,
        owner: &str,
        study_uid: &str,
    ) -> Result<Option<Extraction>, StoreError>;

    /// Set `finalized_at` if unset. `true` only for the winning caller.
    async fn mark_finalized(&self, id: DbId) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TaskStateReader: Send + Sync {
    async fn get(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError>;

    /// States for several tasks; unknown IDs are absent from the map.
    async fn get_many(&self, task_ids: &[DbId]) -> Result<HashMap<DbId, TaskState>, StoreError>;
}

/// Conditional task state writes.
///
/// Every write names the statuses it may start from and returns `None`
/// when the task was not in one of them. Terminal states are never left.
#[async_trait]
pub trait TaskStateStore: TaskStateReader {
    /// Record the work-queue token and move `CREATED -> QUEUED`.
    async fn mark_queued(&self, task_id: DbId, token: &str)
        -> Result<Option<TaskState>, StoreError>;

    async fn transition(
        &self,
        task_id: DbId,
        from: &[TaskStatus],
        transition: TaskTransition,
    ) -> Result<Option<TaskState>, StoreError>;

    /// Raise the cooperative cancellation flag on a non-terminal task.
    async fn request_cancel(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError>;

    async fn is_cancel_requested(&self, task_id: DbId) -> Result<bool, StoreError>;
}

/// The subset of `from` that may legally move to `to`.
pub(crate) fn allowed_sources(from: &[TaskStatus], to: TaskStatus) -> Vec<TaskStatus> {
    from.iter()
        .copied()
        .filter(|s| s.can_transition_to(to))
        .collect()
}
