//! Error Types
//!
//! One enum per failure class. Discovery, configuration and resolution
//! errors are raised before any job runs; job errors only affect the
//! failing job and the jobs downstream of it.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures while scanning the input root for datasets.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("input root does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("input root is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to scan input root {}: {source}", root.display())]
    Io {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown dataset '{name}' (not a subdirectory of {})", root.display())]
    UnknownDataset { name: String, root: PathBuf },
}

/// Malformed path or command patterns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,

    #[error("unbalanced brace in '{0}'")]
    UnbalancedBrace(String),

    #[error("invalid wildcard name '{name}' in '{pattern}'")]
    InvalidWildcardName { pattern: String, name: String },

    #[error("adjacent wildcards in one path component of '{0}' cannot be split unambiguously")]
    AdjacentWildcards(String),

    #[error("wildcard '{{{name}}}' in '{pattern}' has no binding")]
    Unbound { pattern: String, name: String },
}

/// Invalid pipeline configuration or rule definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule '{rule}': {source}")]
    Pattern {
        rule: String,
        #[source]
        source: PatternError,
    },

    #[error("rule '{0}' is defined more than once")]
    DuplicateRule(String),

    #[error("rule '{rule}' has an empty {field}")]
    EmptyField { rule: String, field: &'static str },

    #[error("rule '{rule}': output wildcard '{{{wildcard}}}' does not appear in any input pattern")]
    OutputWildcardNotInInput { rule: String, wildcard: String },

    #[error("rule '{rule}': unknown placeholder '{{{placeholder}}}' in command")]
    UnknownPlaceholder { rule: String, placeholder: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },
}

/// Failures while expanding a target into jobs. All of them abort the run
/// before execution starts.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("target '{}' is produced by more than one rule: {}", target.display(), rules.join(", "))]
    AmbiguousRule { target: PathBuf, rules: Vec<String> },

    #[error("{}", unresolvable_message(target, required_by))]
    UnresolvableTarget {
        target: PathBuf,
        required_by: Option<String>,
    },

    #[error("dependency cycle: {}", cycle_message(chain))]
    DependencyCycle { chain: Vec<PathBuf> },

    #[error("rule '{rule}': {source}")]
    Pattern {
        rule: String,
        #[source]
        source: PatternError,
    },

    #[error("rule '{rule}': cannot render placeholder '{{{placeholder}}}'")]
    Template { rule: String, placeholder: String },
}

fn unresolvable_message(target: &Path, required_by: &Option<String>) -> String {
    match required_by {
        Some(job) => format!(
            "missing input '{}' (required by {}) and no rule produces it",
            target.display(),
            job
        ),
        None => format!(
            "target '{}' does not exist and no rule produces it",
            target.display()
        ),
    }
}

fn cycle_message(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A job whose action could not run or did not succeed.
#[derive(Debug, Error)]
pub enum JobExecutionError {
    #[error("job {job} failed ({status})\n  command: {command}{}", stderr_suffix(stderr))]
    Failed {
        job: String,
        command: String,
        status: String,
        stderr: String,
    },

    #[error("job {job}: input '{}' does not exist", path.display())]
    MissingInput { job: String, path: PathBuf },

    #[error("job {job}: command succeeded but output '{}' was not created", path.display())]
    MissingOutput { job: String, path: PathBuf },

    #[error("job {job}: {source}")]
    Io {
        job: String,
        #[source]
        source: io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n  stderr:\n{}", trimmed)
    }
}

impl JobExecutionError {
    /// Label of the job that failed.
    pub fn job(&self) -> &str {
        match self {
            Self::Failed { job, .. }
            | Self::MissingInput { job, .. }
            | Self::MissingOutput { job, .. }
            | Self::Io { job, .. } => job,
        }
    }
}

/// Journal persistence failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("journal I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal '{}' is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a whole engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("{} job(s) failed, {blocked} job(s) not run because an upstream job failed", failures.len())]
    JobsFailed {
        failures: Vec<JobExecutionError>,
        blocked: usize,
    },
}
