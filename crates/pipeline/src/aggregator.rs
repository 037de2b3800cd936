//! On-demand job status derivation.

use std::sync::Arc;

use quantimage_core::aggregation::{aggregate, JobStatusReport, TaskSnapshot};
use quantimage_core::types::DbId;

use crate::store::{ExtractionStore, StoreError, TaskStateReader};

/// Reads a job's tasks and reduces their current states.
///
/// Holds no cache: every call reflects the latest stored task states, so
/// concurrent callers always agree on the outcome for identical inputs.
pub struct StatusAggregator {
    extractions: Arc<dyn ExtractionStore>,
    states: Arc<dyn TaskStateReader>,
}

impl StatusAggregator {
    pub fn new(extractions: Arc<dyn ExtractionStore>, states: Arc<dyn TaskStateReader>) -> Self {
        Self {
            extractions,
            states,
        }
    }

    /// Aggregated status of `job_id`.
    pub async fn job_status(&self, job_id: DbId) -> Result<JobStatusReport, StoreError> {
        Ok(aggregate(job_id, &self.snapshots(job_id).await?))
    }

    /// Current snapshot of every task of `job_id`.
    ///
    /// Task membership comes from the extraction store and state from the
    /// state reader; a task the reader does not know falls back to the
    /// state recorded alongside it.
    pub async fn snapshots(&self, job_id: DbId) -> Result<Vec<TaskSnapshot>, StoreError> {
        if self.extractions.find(job_id).await?.is_none() {
            return Err(StoreError::NotFound {
                entity: "Extraction",
                id: job_id,
            });
        }

        let tasks = self.extractions.list_tasks(job_id).await?;
        let ids: Vec<DbId> = tasks.iter().map(|t| t.id).collect();
        let mut states = self.states.get_many(&ids).await?;

        Ok(tasks
            .into_iter()
            .map(|task| TaskSnapshot {
                task_id: task.id,
                state: states.remove(&task.id).unwrap_or(task.state),
                study_uid: task.study_uid,
            })
            .collect())
    }
}
