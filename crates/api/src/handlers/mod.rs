pub mod access;
pub mod extractions;
pub mod tasks;
