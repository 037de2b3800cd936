pub mod extraction;
pub mod queue;
pub mod task;
