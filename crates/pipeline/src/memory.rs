//! In-memory implementation of the storage ports.
//!
//! Used by tests and single-process local runs. All state sits behind one
//! `RwLock`, so every operation is atomic with respect to the others, in
//! the same way the PostgreSQL backend relies on conditional updates.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use quantimage_core::extraction::{
    Extraction, ExtractionScope, ExtractionTask, FeatureConfig, TaskState,
};
use quantimage_core::status::TaskStatus;
use quantimage_core::types::{DbId, Timestamp};
use quantimage_db::models::task::TaskTransition;
use tokio::sync::RwLock;

use crate::store::{
    allowed_sources, ExtractionStore, NewExtraction, StoreError, TaskStateReader, TaskStateStore,
};

#[derive(Default)]
struct Inner {
    next_extraction_id: DbId,
    next_task_id: DbId,
    extractions: BTreeMap<DbId, Extraction>,
    tasks: BTreeMap<DbId, ExtractionTask>,
}

impl Inner {
    fn tasks_of(&self, extraction_id: DbId) -> impl Iterator<Item = &ExtractionTask> {
        self.tasks
            .values()
            .filter(move |t| t.extraction_id == extraction_id)
    }

    fn has_active_task(&self, extraction_id: DbId) -> bool {
        self.tasks_of(extraction_id)
            .any(|t| !t.state.status.is_terminal())
    }
}

/// Strictly increasing per-row timestamp.
fn next_timestamp(previous: Timestamp) -> Timestamp {
    std::cmp::max(Utc::now(), previous + Duration::microseconds(1))
}

/// Extraction and task state store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn create_with_tasks(
        &self,
        new: NewExtraction,
    ) -> Result<(Extraction, Vec<ExtractionTask>), StoreError> {
        if new.study_uids.is_empty() {
            return Err(StoreError::Invalid(
                "An extraction must have at least one task".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        let now = Utc::now();

        inner.next_extraction_id += 1;
        let extraction = Extraction {
            id: inner.next_extraction_id,
            owner: new.owner,
            scope: new.scope,
            config: new.config,
            created_at: now,
            finalized_at: None,
        };
        inner.extractions.insert(extraction.id, extraction.clone());

        let mut tasks = Vec::with_capacity(new.study_uids.len());
        for study_uid in new.study_uids {
            inner.next_task_id += 1;
            let task = ExtractionTask {
                id: inner.next_task_id,
                extraction_id: extraction.id,
                study_uid,
                external_job_token: None,
                state: TaskState::created(now),
                created_at: now,
            };
            inner.tasks.insert(task.id, task.clone());
            tasks.push(task);
        }

        Ok((extraction, tasks))
    }

    async fn find(&self, id: DbId) -> Result<Option<Extraction>, StoreError> {
        Ok(self.inner.read().await.extractions.get(&id).cloned())
    }

    async fn list_tasks(&self, extraction_id: DbId) -> Result<Vec<ExtractionTask>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks_of(extraction_id)
            .cloned()
            .collect())
    }

    async fn find_task(&self, task_id: DbId) -> Result<Option<ExtractionTask>, StoreError> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn list_unfinished_tasks(&self) -> Result<Vec<ExtractionTask>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .values()
            .filter(|t| !t.state.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Extraction>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .extractions
            .values()
            .rev()
            .filter(|e| e.owner == owner)
            .cloned()
            .collect())
    }

    async fn find_active(
        &self,
        owner: &str,
        scope: &ExtractionScope,
        config: &FeatureConfig,
    ) -> Result<Option<Extraction>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .extractions
            .values()
            .rev()
            .find(|e| {
                e.owner == owner
                    && &e.scope == scope
                    && &e.config == config
                    && inner.has_active_task(e.id)
            })
            .cloned())
    }

    async fn latest_for_scope(
        &self,
        owner: &str,
        scope: &ExtractionScope,
    ) -> Result<Option<Extraction>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .extractions
            .values()
            .rev()
            .find(|e| e.owner == owner && &e.scope == scope)
            .cloned())
    }

    async fn latest_for_study(
        &self,
        owner: &str,
        study_uid: &str,
    ) -> Result<Option<Extraction>, StoreError> {
        let inner = self.inner.read().await;
        let latest = inner
            .tasks
            .values()
            .rev()
            .filter(|t| t.study_uid == study_uid)
            .filter_map(|t| inner.extractions.get(&t.extraction_id))
            .find(|e| e.owner == owner);
        Ok(latest.cloned())
    }

    async fn mark_finalized(&self, id: DbId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let extraction = inner
            .extractions
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "Extraction",
                id,
            })?;
        if extraction.finalized_at.is_some() {
            return Ok(false);
        }
        extraction.finalized_at = Some(Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl TaskStateReader for MemoryStore {
    async fn get(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .get(&task_id)
            .map(|t| t.state.clone()))
    }

    async fn get_many(&self, task_ids: &[DbId]) -> Result<HashMap<DbId, TaskState>, StoreError> {
        let inner = self.inner.read().await;
        Ok(task_ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).map(|t| (*id, t.state.clone())))
            .collect())
    }
}

#[async_trait]
impl TaskStateStore for MemoryStore {
    async fn mark_queued(
        &self,
        task_id: DbId,
        token: &str,
    ) -> Result<Option<TaskState>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.state.status != TaskStatus::Created {
            return Ok(None);
        }
        task.external_job_token = Some(token.to_string());
        task.state.status = TaskStatus::Queued;
        task.state.updated_at = next_timestamp(task.state.updated_at);
        Ok(Some(task.state.clone()))
    }

    async fn transition(
        &self,
        task_id: DbId,
        from: &[TaskStatus],
        transition: TaskTransition,
    ) -> Result<Option<TaskState>, StoreError> {
        let allowed = allowed_sources(from, transition.to);
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !allowed.contains(&task.state.status) {
            return Ok(None);
        }
        if transition.release_token {
            task.external_job_token = None;
        }
        let state = &mut task.state;
        state.status = transition.to;
        state.progress = transition.progress;
        state.result_ref = transition.result_ref;
        state.error = transition.error;
        state.updated_at = next_timestamp(state.updated_at);
        Ok(Some(state.clone()))
    }

    async fn request_cancel(&self, task_id: DbId) -> Result<Option<TaskState>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.state.status.is_terminal() {
            return Ok(None);
        }
        task.state.cancel_requested = true;
        Ok(Some(task.state.clone()))
    }

    async fn is_cancel_requested(&self, task_id: DbId) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.state.cancel_requested))
    }
}
