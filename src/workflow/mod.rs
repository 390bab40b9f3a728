//! Pipeline Definition and Resolution
//!
//! Everything that happens before a job runs: finding datasets, loading
//! configuration, registering rules and resolving targets into a job
//! graph. Scheduling state and the run journal live here too.
//!
//! # Structure
//!
//! - [`discovery`]: datasets found under the input root
//! - [`wildcards`]: path patterns and wildcard bindings
//! - [`model`]: rule templates, jobs and the job graph
//! - [`registry`]: rule lookup by output path
//! - [`validator`]: rule and configuration checks
//! - [`parser`]: YAML configuration
//! - [`catalog`]: the four pipeline stages as rule templates
//! - [`storage`]: path existence and modification times
//! - [`resolver`]: target to job graph expansion
//! - [`planner`]: which jobs may start
//! - [`state`]: the run journal

pub mod catalog;
pub mod discovery;
pub mod model;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod validator;
pub mod wildcards;

pub use catalog::{build_registry, final_targets, Stage};
pub use discovery::{discover_datasets, Datasets};
pub use model::{Job, JobGraph, JobId, RuleTemplate, RunReason};
pub use parser::{load_config, PipelineConfig};
pub use planner::{ExecutionPlanner, JobStatus};
pub use registry::RuleRegistry;
pub use resolver::Resolver;
pub use state::RunJournal;
pub use storage::{LocalStorage, Storage};
