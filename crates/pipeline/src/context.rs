//! Explicitly constructed extraction runtime.
//!
//! [`ExtractionContext`] wires stores, queue, collaborators and the
//! orchestration components together. It is built once, from
//! [`PipelineConfig`] or piece by piece with [`ExtractionContextBuilder`],
//! and shared as `Arc<ExtractionContext>` by the API and the worker.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use quantimage_core::extraction::ReusePolicy;
use quantimage_db::DbPool;
use quantimage_events::{BusPublisher, EventBus, EventPublisher};

use crate::aggregator::StatusAggregator;
use crate::artifacts::ArtifactStore;
use crate::catalog::{Catalog, CatalogError, HttpCatalog, StaticCatalog};
use crate::compute::{CommandFeatureComputer, FeatureComputer};
use crate::dispatcher::JobDispatcher;
use crate::executor::TaskExecutor;
use crate::finalize::Finalizer;
use crate::http_store::HttpTaskStateReader;
use crate::pg_queue::PgQueue;
use crate::postgres::{PgExtractionStore, PgTaskStateStore};
use crate::processor::TaskProcessor;
use crate::queue::{LocalQueue, WorkQueue};
use crate::source::{DicomWebSource, DirectorySource, ImagingSource, SourceError};
use crate::store::{ExtractionStore, StoreError, TaskStateReader, TaskStateStore};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Which work queue the dispatcher submits to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueBackend {
    /// In-process worker pool.
    #[default]
    Local,
    /// `task_queue` table, drained by worker processes.
    Postgres,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local" => Ok(Self::Local),
            "postgres" => Ok(Self::Postgres),
            other => Err(format!("Unknown queue backend '{other}'")),
        }
    }
}

/// Settings shared by the API and worker processes.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub features_dir: PathBuf,
    pub feature_backend_dir: PathBuf,
    pub feature_timeout: Duration,
    /// DICOMweb base URL of the catalog and imaging archive.
    pub catalog_url: Option<String>,
    pub catalog_token: Option<String>,
    /// Study directory tree used when no catalog URL is configured.
    pub studies_dir: PathBuf,
    /// When set, task state reads go to this status service.
    pub status_service_url: Option<String>,
    pub queue_backend: QueueBackend,
    pub worker_concurrency: usize,
    pub reuse_policy: ReusePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            features_dir: PathBuf::from("./data/features"),
            feature_backend_dir: PathBuf::from("./backends"),
            feature_timeout: Duration::from_secs(1800),
            catalog_url: None,
            catalog_token: None,
            studies_dir: PathBuf::from("./data/studies"),
            status_service_url: None,
            queue_backend: QueueBackend::Local,
            worker_concurrency: 4,
            reuse_policy: ReusePolicy::ReuseActive,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Missing component: {0}")]
    Missing(&'static str),

    #[error("Catalog setup failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Imaging source setup failed: {0}")]
    Source(#[from] SourceError),

    #[error("Status reader setup failed: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct ExtractionContext {
    pub extractions: Arc<dyn ExtractionStore>,
    pub states: Arc<dyn TaskStateStore>,
    pub reader: Arc<dyn TaskStateReader>,
    pub queue: Arc<dyn WorkQueue>,
    pub bus: Arc<EventBus>,
    pub publisher: Arc<dyn EventPublisher>,
    pub artifacts: ArtifactStore,
    pub aggregator: Arc<StatusAggregator>,
    pub finalizer: Arc<Finalizer>,
    pub dispatcher: Arc<JobDispatcher>,
    pub processor: Arc<TaskProcessor>,
    local_pool: Option<Arc<LocalQueue>>,
}

impl ExtractionContext {
    pub fn builder() -> ExtractionContextBuilder {
        ExtractionContextBuilder::default()
    }

    /// Build the production wiring: PostgreSQL stores, DICOMweb catalog
    /// and archive, subprocess feature backends.
    ///
    /// `publisher` decides where events go: the API passes a bus
    /// publisher, worker processes a `pg_notify` publisher.
    pub fn from_config(
        config: &PipelineConfig,
        pool: DbPool,
        bus: Arc<EventBus>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self, ContextError> {
        let states = Arc::new(PgTaskStateStore::new(pool.clone()));

        let mut builder = Self::builder()
            .extraction_store(Arc::new(PgExtractionStore::new(pool.clone())))
            .state_store(states)
            .bus(bus)
            .publisher(publisher)
            .artifacts_dir(config.features_dir.clone())
            .computer(Arc::new(CommandFeatureComputer::new(
                config.feature_backend_dir.clone(),
                config.feature_timeout,
            )))
            .reuse_policy(config.reuse_policy)
            .worker_concurrency(config.worker_concurrency);

        builder = match &config.catalog_url {
            Some(url) => builder
                .catalog(Arc::new(HttpCatalog::new(url.clone(), config.catalog_token.clone())?))
                .source(Arc::new(DicomWebSource::new(url.clone())?)),
            None => {
                tracing::warn!(
                    studies_dir = %config.studies_dir.display(),
                    "No catalog configured, reading studies from the local directory",
                );
                let catalog = StaticCatalog::new()
                    .with_token(config.catalog_token.clone().unwrap_or_default());
                builder
                    .catalog(Arc::new(catalog))
                    .source(Arc::new(DirectorySource::new(config.studies_dir.clone())))
            }
        };

        if let Some(url) = &config.status_service_url {
            builder = builder.state_reader(Arc::new(HttpTaskStateReader::new(url.clone())?));
        }

        if config.queue_backend == QueueBackend::Postgres {
            builder = builder.queue(Arc::new(PgQueue::new(pool)));
        }

        builder.build()
    }

    /// Stop the in-process worker pool, waiting for running tasks.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.local_pool {
            pool.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ExtractionContextBuilder {
    extractions: Option<Arc<dyn ExtractionStore>>,
    states: Option<Arc<dyn TaskStateStore>>,
    /// The state store seen through its read half.
    primary_reader: Option<Arc<dyn TaskStateReader>>,
    reader: Option<Arc<dyn TaskStateReader>>,
    queue: Option<Arc<dyn WorkQueue>>,
    catalog: Option<Arc<dyn Catalog>>,
    source: Option<Arc<dyn ImagingSource>>,
    computer: Option<Arc<dyn FeatureComputer>>,
    bus: Option<Arc<EventBus>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    artifacts_dir: Option<PathBuf>,
    reuse_policy: ReusePolicy,
    worker_concurrency: Option<usize>,
}

impl ExtractionContextBuilder {
    pub fn extraction_store(mut self, store: Arc<dyn ExtractionStore>) -> Self {
        self.extractions = Some(store);
        self
    }

    /// Use `store` for task state writes and, unless overridden with
    /// [`state_reader`](Self::state_reader), for reads.
    pub fn state_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TaskStateStore + 'static,
    {
        self.reader.get_or_insert_with(|| store.clone() as Arc<dyn TaskStateReader>);
        self.primary_reader = Some(store.clone());
        self.states = Some(store);
        self
    }

    /// Serve polling and follow from `reader`. Job finalize keeps reading
    /// the state store, which never lags its own writes.
    pub fn state_reader(mut self, reader: Arc<dyn TaskStateReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Submit to `queue` instead of starting the in-process pool.
    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn source(mut self, source: Arc<dyn ImagingSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn computer(mut self, computer: Arc<dyn FeatureComputer>) -> Self {
        self.computer = Some(computer);
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to publishing on the bus.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    pub fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = Some(concurrency);
        self
    }

    /// Wire everything together. Starts the in-process pool when no
    /// queue was supplied, so it must run inside a tokio runtime.
    pub fn build(self) -> Result<ExtractionContext, ContextError> {
        let extractions = self.extractions.ok_or(ContextError::Missing("extraction store"))?;
        let states = self.states.ok_or(ContextError::Missing("task state store"))?;
        let primary_reader = self
            .primary_reader
            .ok_or(ContextError::Missing("task state store"))?;
        let reader = self.reader.ok_or(ContextError::Missing("task state reader"))?;
        let catalog = self.catalog.ok_or(ContextError::Missing("catalog"))?;
        let source = self.source.ok_or(ContextError::Missing("imaging source"))?;
        let computer = self.computer.ok_or(ContextError::Missing("feature computer"))?;
        let artifacts_dir = self.artifacts_dir.ok_or(ContextError::Missing("artifacts directory"))?;
        let bus = self.bus.unwrap_or_default();
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(BusPublisher::new(Arc::clone(&bus))));
        let artifacts = ArtifactStore::new(artifacts_dir);

        let aggregator = Arc::new(StatusAggregator::new(
            Arc::clone(&extractions),
            Arc::clone(&reader),
        ));
        let finalizer = Arc::new(Finalizer::new(
            Arc::clone(&extractions),
            Arc::new(StatusAggregator::new(Arc::clone(&extractions), primary_reader)),
            Arc::clone(&publisher),
        ));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&extractions),
            Arc::clone(&states),
            Arc::clone(&catalog),
            source,
            computer,
            artifacts.clone(),
            Arc::clone(&publisher),
        ));
        let processor = Arc::new(TaskProcessor::new(executor, Arc::clone(&finalizer)));

        let (queue, local_pool) = match self.queue {
            Some(queue) => (queue, None),
            None => {
                let pool = Arc::new(LocalQueue::start(
                    Arc::clone(&processor),
                    self.worker_concurrency.unwrap_or(4),
                ));
                (Arc::clone(&pool) as Arc<dyn WorkQueue>, Some(pool))
            }
        };

        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::clone(&extractions),
            Arc::clone(&states),
            Arc::clone(&queue),
            catalog,
            Arc::clone(&publisher),
            Arc::clone(&finalizer),
            self.reuse_policy,
        ));

        Ok(ExtractionContext {
            extractions,
            states,
            reader,
            queue,
            bus,
            publisher,
            artifacts,
            aggregator,
            finalizer,
            dispatcher,
            processor,
            local_pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn queue_backend_parses() {
        assert_eq!("local".parse::<QueueBackend>().unwrap(), QueueBackend::Local);
        assert_eq!("postgres".parse::<QueueBackend>().unwrap(), QueueBackend::Postgres);
        assert!("redis".parse::<QueueBackend>().is_err());
    }

    #[test]
    fn build_reports_missing_components() {
        let store = Arc::new(MemoryStore::new());
        let result = ExtractionContext::builder()
            .extraction_store(store.clone())
            .state_store(store)
            .build();
        assert!(matches!(result, Err(ContextError::Missing("catalog"))));
    }
}
