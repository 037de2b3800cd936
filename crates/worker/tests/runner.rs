use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quantimage_core::aggregation::JobStatus;
use quantimage_core::extraction::{ExtractionScope, FeatureConfig, TaskErrorKind, TaskProgress};
use quantimage_core::status::TaskStatus;
use quantimage_db::models::task::TaskTransition;
use quantimage_core::features::FeatureMap;
use quantimage_core::types::DbId;
use quantimage_pipeline::catalog::StaticCatalog;
use quantimage_pipeline::compute::{ComputeError, FeatureComputer, PreparedInput};
use quantimage_pipeline::pg_queue::ClaimedInvocation;
use quantimage_pipeline::source::DirectorySource;
use quantimage_pipeline::{
    follow_job, DispatchRequest, ExtractionContext, MemoryStore, QueueError, TaskInvocation,
    TaskStateStore, WorkQueue,
};
use quantimage_worker::runner::{ClaimQueue, Maintenance, WorkerRuntime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// A claimed entry and its lease.
struct Lease {
    claimed: ClaimedInvocation,
    worker: String,
    renewed: Instant,
}

/// In-memory stand-in for the `task_queue` table.
#[derive(Default)]
struct MemoryQueue {
    next_entry: Mutex<DbId>,
    pending: Mutex<VecDeque<ClaimedInvocation>>,
    leases: Mutex<Vec<Lease>>,
    completed: Mutex<Vec<DbId>>,
    claims: Mutex<Vec<String>>,
    prunes: Mutex<usize>,
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn submit(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        let mut next = self.next_entry.lock().await;
        *next += 1;
        self.pending.lock().await.push_back(ClaimedInvocation {
            entry_id: *next,
            invocation,
        });
        Ok(())
    }

    async fn withdraw(&self, task_id: DbId) -> Result<bool, QueueError> {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|c| c.invocation.task_id != task_id);
        Ok(pending.len() != before)
    }

    async fn is_pending(&self, task_id: DbId) -> Result<bool, QueueError> {
        let waiting = self
            .pending
            .lock()
            .await
            .iter()
            .any(|c| c.invocation.task_id == task_id);
        let claimed = self
            .leases
            .lock()
            .await
            .iter()
            .any(|l| l.claimed.invocation.task_id == task_id);
        Ok(waiting || claimed)
    }
}

#[async_trait]
impl ClaimQueue for MemoryQueue {
    async fn claim_next(&self, worker_name: &str) -> Result<Option<ClaimedInvocation>, QueueError> {
        let Some(claimed) = self.pending.lock().await.pop_front() else {
            return Ok(None);
        };
        self.claims.lock().await.push(worker_name.to_string());
        self.leases.lock().await.push(Lease {
            claimed: claimed.clone(),
            worker: worker_name.to_string(),
            renewed: Instant::now(),
        });
        Ok(Some(claimed))
    }

    async fn complete(&self, entry_id: DbId) -> Result<(), QueueError> {
        self.leases.lock().await.retain(|l| l.claimed.entry_id != entry_id);
        self.completed.lock().await.push(entry_id);
        Ok(())
    }

    async fn renew(&self, entry_id: DbId, worker_name: &str) -> Result<bool, QueueError> {
        let mut leases = self.leases.lock().await;
        match leases
            .iter_mut()
            .find(|l| l.claimed.entry_id == entry_id && l.worker == worker_name)
        {
            Some(lease) => {
                lease.renewed = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_stale(&self, lease: Duration) -> Result<Vec<ClaimedInvocation>, QueueError> {
        let mut leases = self.leases.lock().await;
        let (stale, live): (Vec<Lease>, Vec<Lease>) = leases
            .drain(..)
            .partition(|l| l.renewed.elapsed() > lease);
        *leases = live;
        Ok(stale.into_iter().map(|l| l.claimed).collect())
    }

    async fn prune_completed(&self, _retention: Duration) -> Result<u64, QueueError> {
        *self.prunes.lock().await += 1;
        Ok(0)
    }
}

struct CountingComputer;

#[async_trait]
impl FeatureComputer for CountingComputer {
    async fn preprocess(&self, dir: &Path) -> Result<PreparedInput, ComputeError> {
        let mut file_count = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while entries.next_entry().await?.is_some() {
            file_count += 1;
        }
        Ok(PreparedInput {
            dir: dir.to_path_buf(),
            file_count,
        })
    }

    async fn compute(
        &self,
        input: &PreparedInput,
        family: &str,
        _config: &serde_json::Value,
    ) -> Result<FeatureMap, ComputeError> {
        let mut map = FeatureMap::new();
        map.insert(format!("{family}_files"), serde_json::json!(input.file_count));
        Ok(map)
    }
}

fn write_study(root: &Path, study: &str, files: &[&str]) {
    let dir = root.join(study);
    std::fs::create_dir_all(&dir).unwrap();
    for file in files {
        std::fs::write(dir.join(file), b"DICM").unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runtime_drains_queue_and_completes_entries() {
    let studies = tempfile::tempdir().unwrap();
    let features = tempfile::tempdir().unwrap();
    write_study(studies.path(), "1.1", &["ct-1.dcm", "ct-2.dcm", "rt.dcm"]);
    write_study(studies.path(), "1.2", &["ct-1.dcm"]);
    // "1.3" has no directory: its fetch fails.

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::default());
    let ctx = ExtractionContext::builder()
        .extraction_store(store.clone())
        .state_store(store)
        .queue(queue.clone())
        .catalog(Arc::new(
            StaticCatalog::new().with_album("cohort", &["1.1", "1.2", "1.3"]),
        ))
        .source(Arc::new(DirectorySource::new(studies.path())))
        .computer(Arc::new(CountingComputer))
        .artifacts_dir(features.path())
        .build()
        .unwrap();

    let outcome = ctx
        .dispatcher
        .dispatch(DispatchRequest {
            owner: "alice".into(),
            scope: ExtractionScope::Album {
                album_id: "cohort".into(),
            },
            config: FeatureConfig {
                families: [("pyradiomics".to_string(), serde_json::json!({}))]
                    .into_iter()
                    .collect(),
            },
        })
        .await
        .unwrap();
    assert_eq!(queue.pending.lock().await.len(), 3);

    let runtime = WorkerRuntime::new(
        queue.clone(),
        Arc::clone(&ctx.processor),
        "test-worker",
        2,
        Duration::from_millis(10),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));

    let report = follow_job(
        &ctx.aggregator,
        &ctx.bus,
        outcome.extraction.id,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(report.status, JobStatus::CompleteWithErrors);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].study_uid, "1.3");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let mut completed = queue.completed.lock().await.clone();
    completed.sort_unstable();
    assert_eq!(completed, vec![1, 2, 3]);
    assert!(queue.claims.lock().await.iter().all(|w| w == "test-worker"));

    let task = ctx
        .extractions
        .list_tasks(outcome.extraction.id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.study_uid == "1.1")
        .unwrap();
    let result = ctx
        .artifacts
        .read(task.state.result_ref.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(result["pyradiomics_files"], serde_json::json!(3));
}

#[tokio::test]
async fn runtime_stops_promptly_when_idle() {
    let store = Arc::new(MemoryStore::new());
    let features = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::default());
    let ctx = ExtractionContext::builder()
        .extraction_store(store.clone())
        .state_store(store)
        .queue(queue.clone())
        .catalog(Arc::new(StaticCatalog::new()))
        .source(Arc::new(DirectorySource::new(features.path())))
        .computer(Arc::new(CountingComputer))
        .artifacts_dir(features.path())
        .build()
        .unwrap();

    let runtime = WorkerRuntime::new(
        queue,
        Arc::clone(&ctx.processor),
        "idle-worker",
        1,
        Duration::from_secs(3600),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn expired_claims_are_recovered_by_a_live_worker() {
    let studies = tempfile::tempdir().unwrap();
    let features = tempfile::tempdir().unwrap();
    write_study(studies.path(), "5.1", &["ct.dcm"]);
    write_study(studies.path(), "5.2", &["ct.dcm"]);

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::default());
    let ctx = ExtractionContext::builder()
        .extraction_store(store.clone())
        .state_store(store.clone())
        .queue(queue.clone())
        .catalog(Arc::new(StaticCatalog::new().with_album("pair", &["5.1", "5.2"])))
        .source(Arc::new(DirectorySource::new(studies.path())))
        .computer(Arc::new(CountingComputer))
        .artifacts_dir(features.path())
        .build()
        .unwrap();

    let outcome = ctx
        .dispatcher
        .dispatch(DispatchRequest {
            owner: "alice".into(),
            scope: ExtractionScope::Album {
                album_id: "pair".into(),
            },
            config: FeatureConfig {
                families: [("pyradiomics".to_string(), serde_json::json!({}))]
                    .into_iter()
                    .collect(),
            },
        })
        .await
        .unwrap();

    // A worker claims both entries, starts the first task, then dies.
    queue.claim_next("dead-worker").await.unwrap().unwrap();
    queue.claim_next("dead-worker").await.unwrap().unwrap();
    let interrupted = outcome.tasks[0].id;
    store
        .transition(
            interrupted,
            &[TaskStatus::Queued],
            TaskTransition::running(TaskProgress::new(1, 3, "Fetching DICOM files")),
        )
        .await
        .unwrap()
        .unwrap();

    let runtime = WorkerRuntime::new(
        queue.clone(),
        Arc::clone(&ctx.processor),
        "live-worker",
        2,
        Duration::from_millis(10),
    )
    .with_maintenance(Maintenance {
        dispatcher: Arc::clone(&ctx.dispatcher),
        lease: Duration::from_millis(100),
        retention: Duration::from_secs(3600),
        interval: Duration::from_millis(20),
    });
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));

    let report = follow_job(
        &ctx.aggregator,
        &ctx.bus,
        outcome.extraction.id,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(report.status, JobStatus::CompleteWithErrors);
    assert_eq!(report.successful_studies, vec!["5.2".to_string()]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].task_id, interrupted);
    assert_eq!(report.errors[0].kind, TaskErrorKind::Internal);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let claims = queue.claims.lock().await.clone();
    assert_eq!(claims, vec!["dead-worker", "dead-worker", "live-worker"]);
    assert!(*queue.prunes.lock().await >= 1);
}
