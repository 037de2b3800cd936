//! Extraction orchestration engine.
//!
//! The [`JobDispatcher`] fans an extraction out into per-study tasks on a
//! [`WorkQueue`]; [`TaskExecutor`]s run them and write state through the
//! [`TaskStateStore`]; the [`StatusAggregator`] derives job status on
//! demand and the [`Finalizer`] publishes completion exactly once.
//! Everything is wired explicitly in an [`ExtractionContext`].

pub mod aggregator;
pub mod artifacts;
pub mod catalog;
pub mod compute;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod finalize;
pub mod follow;
pub mod http_store;
pub mod memory;
pub mod pg_queue;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod source;
pub mod store;

pub use aggregator::StatusAggregator;
pub use config::ConfigError;
pub use context::{ExtractionContext, PipelineConfig, QueueBackend};
pub use dispatcher::{
    CancelOutcome, CreateJobError, DispatchError, DispatchOutcome, DispatchRequest, JobDispatcher,
    RecoveryOutcome, ScopeResolutionError,
};
pub use executor::{CancellationError, ExecutionOutcome, PipelineError, TaskExecutor};
pub use finalize::Finalizer;
pub use follow::{follow_job, FollowError};
pub use memory::MemoryStore;
pub use queue::{LocalQueue, QueueError, TaskInvocation, WorkQueue};
pub use store::{ExtractionStore, StoreError, TaskStateReader, TaskStateStore};
