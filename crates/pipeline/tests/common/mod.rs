#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quantimage_core::extraction::{ExtractionScope, FeatureConfig, TaskState};
use quantimage_core::features::FeatureMap;
use quantimage_core::job_events::ExtractionEvent;
use quantimage_core::status::TaskStatus;
use quantimage_core::types::DbId;
use quantimage_pipeline::catalog::{AccessToken, StaticCatalog};
use quantimage_pipeline::compute::{ComputeError, FeatureComputer, PreparedInput};
use quantimage_pipeline::context::ExtractionContextBuilder;
use quantimage_pipeline::source::{ImagingSource, SourceError};
use quantimage_pipeline::{
    DispatchRequest, ExtractionContext, MemoryStore, QueueError, StoreError, TaskInvocation,
    TaskStateReader, WorkQueue,
};
use tokio::sync::{broadcast, Mutex, Notify};

pub const OWNER: &str = "alice";
pub const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Fake imaging source
// ---------------------------------------------------------------------------

/// Writes two files per study. Studies listed in `failing` error out;
/// when a gate is set, every fetch waits for it first.
#[derive(Default)]
pub struct FakeSource {
    pub failing: HashSet<String>,
    pub gate: Option<Arc<Notify>>,
}

#[async_trait]
impl ImagingSource for FakeSource {
    async fn fetch(
        &self,
        study_uid: &str,
        _token: &AccessToken,
        dest: &Path,
    ) -> Result<usize, SourceError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.failing.contains(study_uid) {
            return Err(SourceError::Api {
                status: 502,
                url: format!("http://pacs/studies/{study_uid}"),
            });
        }
        tokio::fs::write(dest.join("ct.dcm"), b"CT").await?;
        tokio::fs::write(dest.join("rtstruct.dcm"), b"RT").await?;
        Ok(2)
    }
}

// ---------------------------------------------------------------------------
// Fake feature computer
// ---------------------------------------------------------------------------

/// Returns `{family}_mean` plus a diagnostics entry per family.
pub struct FakeComputer;

#[async_trait]
impl FeatureComputer for FakeComputer {
    async fn preprocess(&self, dir: &Path) -> Result<PreparedInput, ComputeError> {
        Ok(PreparedInput {
            dir: dir.to_path_buf(),
            file_count: 2,
        })
    }

    async fn compute(
        &self,
        _input: &PreparedInput,
        family: &str,
        _config: &serde_json::Value,
    ) -> Result<FeatureMap, ComputeError> {
        let mut map = FeatureMap::new();
        map.insert(format!("{family}_mean"), serde_json::json!(1.5));
        map.insert(
            format!("diagnostics_{family}_version"),
            serde_json::json!("3.0"),
        );
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Scripted work queue
// ---------------------------------------------------------------------------

/// Records submissions instead of running them. Submissions whose
/// zero-based index is in `fail_on` are refused.
#[derive(Default)]
pub struct ScriptedQueue {
    pub fail_on: HashSet<usize>,
    attempts: Mutex<usize>,
    pub submitted: Mutex<Vec<TaskInvocation>>,
    pub withdrawn: Mutex<Vec<DbId>>,
}

impl ScriptedQueue {
    pub fn failing_on(indices: &[usize]) -> Self {
        Self {
            fail_on: indices.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub async fn submitted(&self) -> Vec<TaskInvocation> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl WorkQueue for ScriptedQueue {
    async fn submit(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        let mut attempts = self.attempts.lock().await;
        let index = *attempts;
        *attempts += 1;
        if self.fail_on.contains(&index) {
            return Err(QueueError::Rejected("broker unavailable".to_string()));
        }
        self.submitted.lock().await.push(invocation);
        Ok(())
    }

    async fn withdraw(&self, task_id: DbId) -> Result<bool, QueueError> {
        self.withdrawn.lock().await.push(task_id);
        Ok(true)
    }

    async fn is_pending(&self, task_id: DbId) -> Result<bool, QueueError> {
        let submitted = self
            .submitted
            .lock()
            .await
            .iter()
            .any(|i| i.task_id == task_id);
        Ok(submitted && !self.withdrawn.lock().await.contains(&task_id))
    }
}

// ---------------------------------------------------------------------------
// Lagging status reader
// ---------------------------------------------------------------------------

/// Reads through to a store but, while `lagging`, reports terminal tasks
/// as still running, like a status service that has not caught up.
pub struct LaggingReader {
    inner: Arc<MemoryStore>,
    pub lagging: AtomicBool,
}

impl LaggingReader {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            lagging: AtomicBool::new(true),
        }
    }

    pub fn catch_up(&self) {
        self.lagging.store(false, Ordering::SeqCst);
    }

    fn view(&self, mut state: TaskState) -> TaskState {
        if self.lagging.load(Ordering::SeqCst) && state.status.is_terminal() {
            state.status = TaskStatus::Running;
            state.result_ref = None;
            state.error = None;
        }
        state
    }
}

#[async_trait]
impl TaskStateReader for LaggingReader {
    async fn get(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        Ok(self.inner.get(task_id).await?.map(|s| self.view(s)))
    }

    async fn get_many(&self, task_ids: &[DbId]) -> Result<HashMap<DbId, TaskState>, StoreError> {
        Ok(self
            .inner
            .get_many(task_ids)
            .await?
            .into_iter()
            .map(|(id, s)| (id, self.view(s)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Context helpers
// ---------------------------------------------------------------------------

pub fn families(names: &[&str]) -> FeatureConfig {
    FeatureConfig {
        families: names
            .iter()
            .map(|n| (n.to_string(), serde_json::json!({"binWidth": 25})))
            .collect(),
    }
}

pub fn album_request(album_id: &str) -> DispatchRequest {
    DispatchRequest {
        owner: OWNER.to_string(),
        scope: ExtractionScope::Album {
            album_id: album_id.to_string(),
        },
        config: families(&["pyradiomics"]),
    }
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_token("service-token")
        .with_album("lung", &["1.1", "1.2", "1.3", "1.4", "1.5"])
        .with_album("pair", &["2.1", "2.2"])
        .with_album("trio", &["3.1", "3.2", "3.3"])
        .with_album("dupes", &["4.1", "4.1", "4.2"])
        .with_album("empty", &[])
}

/// Builder pre-loaded with in-memory stores and fakes.
pub fn builder(store: &Arc<MemoryStore>, features_dir: &Path) -> ExtractionContextBuilder {
    ExtractionContext::builder()
        .extraction_store(store.clone())
        .state_store(store.clone())
        .catalog(Arc::new(catalog()))
        .source(Arc::new(FakeSource::default()))
        .computer(Arc::new(FakeComputer))
        .artifacts_dir(features_dir)
}

/// Drain every event currently buffered on a bus receiver.
pub fn drain(rx: &mut broadcast::Receiver<ExtractionEvent>) -> Vec<ExtractionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll until `task_id` reaches `status`.
pub async fn wait_for_status(reader: &dyn TaskStateReader, task_id: DbId, status: TaskStatus) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(Some(state)) = reader.get(task_id).await {
                if state.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not reach the expected status in time");
}
