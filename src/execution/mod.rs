//! Job Execution
//!
//! - [`engine`]: schedules a resolved job graph across worker threads
//! - [`job`]: runs one job's action under bash

pub mod engine;
pub mod job;

pub use engine::{Engine, RunSummary};
pub use job::execute_job;
