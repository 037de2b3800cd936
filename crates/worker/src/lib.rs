//! `quantimage-worker` library crate.
//!
//! Claims queued extraction tasks from PostgreSQL and runs them with
//! bounded concurrency. The binary entrypoint lives in `main.rs`.

pub mod config;
pub mod runner;
