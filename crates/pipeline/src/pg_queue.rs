//! Durable work queue on the `task_queue` table, shared between the API
//! (submitting) and worker processes (claiming).

use std::time::Duration;

use async_trait::async_trait;
use quantimage_core::types::DbId;
use quantimage_db::models::queue::QueueEntry;
use quantimage_db::repositories::QueueRepo;
use quantimage_db::DbPool;

use crate::queue::{QueueError, TaskInvocation, WorkQueue};

/// A claimed queue entry.
#[derive(Debug, Clone)]
pub struct ClaimedInvocation {
    pub entry_id: DbId,
    pub invocation: TaskInvocation,
}

impl From<QueueEntry> for ClaimedInvocation {
    fn from(entry: QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            invocation: TaskInvocation {
                task_id: entry.task_id,
                token: entry.token,
            },
        }
    }
}

pub struct PgQueue {
    pool: DbPool,
}

impl PgQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Claim the oldest unclaimed invocation for `worker_name`.
    pub async fn claim_next(
        &self,
        worker_name: &str,
    ) -> Result<Option<ClaimedInvocation>, QueueError> {
        Ok(QueueRepo::claim_next(&self.pool, worker_name)
            .await?
            .map(ClaimedInvocation::from))
    }

    pub async fn complete(&self, entry_id: DbId) -> Result<(), QueueError> {
        QueueRepo::complete(&self.pool, entry_id).await?;
        Ok(())
    }

    /// Extend the lease on a claimed entry. `false` means the claim was
    /// already released.
    pub async fn renew(&self, entry_id: DbId, worker_name: &str) -> Result<bool, QueueError> {
        Ok(QueueRepo::renew(&self.pool, entry_id, worker_name).await?)
    }

    /// Close claims not renewed within `lease`.
    pub async fn release_stale(&self, lease: Duration) -> Result<Vec<ClaimedInvocation>, QueueError> {
        Ok(QueueRepo::release_stale(&self.pool, lease)
            .await?
            .into_iter()
            .map(ClaimedInvocation::from)
            .collect())
    }

    pub async fn prune_completed(&self, retention: Duration) -> Result<u64, QueueError> {
        Ok(QueueRepo::prune_completed(&self.pool, retention).await?)
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn submit(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        let payload = serde_json::to_value(&invocation)?;
        QueueRepo::enqueue(&self.pool, &invocation.token, invocation.task_id, &payload).await?;
        Ok(())
    }

    async fn withdraw(&self, task_id: DbId) -> Result<bool, QueueError> {
        Ok(QueueRepo::remove_unclaimed(&self.pool, task_id).await?)
    }

    async fn is_pending(&self, task_id: DbId) -> Result<bool, QueueError> {
        Ok(QueueRepo::has_live_entry(&self.pool, task_id).await?)
    }
}
