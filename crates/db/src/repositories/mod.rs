//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod extraction_repo;
pub mod queue_repo;
pub mod task_repo;

pub use extraction_repo::ExtractionRepo;
pub use queue_repo::QueueRepo;
pub use task_repo::TaskRepo;
