//! Completion handling for tasks and jobs.
//!
//! Whoever moves a task into a terminal state hands it to the
//! [`Finalizer`]: the executor path after a run, the dispatcher after a
//! submission failure, and the cancel path. Job finalize is guarded by a
//! compare-and-set on `finalized_at`, so only one caller ever publishes the
//! job's terminal event.

use std::sync::Arc;

use chrono::Utc;
use quantimage_core::aggregation::JobStatusReport;
use quantimage_core::extraction::TaskState;
use quantimage_core::job_events::ExtractionEvent;
use quantimage_core::types::DbId;
use quantimage_events::{publish_or_log, EventPublisher};

use crate::aggregator::StatusAggregator;
use crate::store::{ExtractionStore, StoreError};

pub struct Finalizer {
    extractions: Arc<dyn ExtractionStore>,
    /// Must read the store task writers go to; a lagging reader would see
    /// the last task still running and the job would never finalize.
    aggregator: Arc<StatusAggregator>,
    publisher: Arc<dyn EventPublisher>,
}

impl Finalizer {
    pub fn new(
        extractions: Arc<dyn ExtractionStore>,
        aggregator: Arc<StatusAggregator>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            extractions,
            aggregator,
            publisher,
        }
    }

    /// Task-level finalize: publish the terminal task event, then try the
    /// job-level finalize.
    ///
    /// Returns the job report when this call finalized the job.
    pub async fn task_finished(
        &self,
        job_id: DbId,
        task_id: DbId,
        state: &TaskState,
    ) -> Result<Option<JobStatusReport>, StoreError> {
        tracing::info!(
            job_id,
            task_id,
            status = %state.status,
            "Extraction task finished",
        );
        publish_or_log(
            self.publisher.as_ref(),
            ExtractionEvent::task(task_id, job_id, state),
        )
        .await;

        self.finalize_job(job_id).await
    }

    /// Job-level finalize. A no-op unless every task is terminal and no
    /// earlier call already finalized the job.
    pub async fn finalize_job(&self, job_id: DbId) -> Result<Option<JobStatusReport>, StoreError> {
        let report = self.aggregator.job_status(job_id).await?;
        if !report.status.is_terminal() {
            return Ok(None);
        }
        if !self.extractions.mark_finalized(job_id).await? {
            tracing::debug!(job_id, "Extraction already finalized");
            return Ok(None);
        }

        tracing::info!(
            job_id,
            status = %report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            "Extraction finalized",
        );
        publish_or_log(
            self.publisher.as_ref(),
            ExtractionEvent::job(&report, Utc::now()),
        )
        .await;

        Ok(Some(report))
    }
}
