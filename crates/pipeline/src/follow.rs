//! Waiting for a job to reach a terminal status.
//!
//! Events are only hints: every delivery (or lag notice) triggers a fresh
//! aggregation from the store, so duplicated, reordered or dropped events
//! cannot produce a wrong answer.

use std::time::Duration;

use quantimage_core::aggregation::JobStatusReport;
use quantimage_core::job_events::Topic;
use quantimage_core::types::DbId;
use quantimage_events::EventBus;

use crate::aggregator::StatusAggregator;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum FollowError {
    #[error("Extraction {job_id} did not finish within {timeout:?}")]
    Timeout { job_id: DbId, timeout: Duration },

    #[error("Event bus closed")]
    BusClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Block until `job_id` is terminal and return its final report.
///
/// Uses one dedicated bus subscription, opened before the first read so
/// no transition between the read and the subscription is missed.
/// Dropping the returned future ends the follow.
pub async fn follow_job(
    aggregator: &StatusAggregator,
    bus: &EventBus,
    job_id: DbId,
    timeout: Duration,
) -> Result<JobStatusReport, FollowError> {
    let mut subscription = bus.subscribe_topic(Topic::Job(job_id));

    let wait = async {
        loop {
            let report = aggregator.job_status(job_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if subscription.recv().await.is_none() {
                return Err(FollowError::BusClosed);
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_elapsed) => Err(FollowError::Timeout { job_id, timeout }),
    }
}
