//! Run Journal
//!
//! Records which outputs are being written so that a crashed or failed
//! job cannot leave behind an output that looks up to date.
//!
//! The journal lives at `<state_dir>/journal.json` and is rewritten after
//! every job start and finish. An output listed as incomplete is stale
//! on the next run even if it exists and is newer than its inputs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::parser::JOURNAL_FILE;
use super::wildcards::normalize_path;
use crate::error::StateError;

/// The most recent job failure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FailureRecord {
    pub job: String,
    pub output: PathBuf,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Persistent progress record for a pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunJournal {
    #[serde(skip)]
    path: PathBuf,

    /// Outputs whose job started but has not finished successfully
    #[serde(default)]
    pub incomplete: BTreeSet<PathBuf>,

    /// When each output was last produced
    #[serde(default)]
    pub completed: BTreeMap<PathBuf, DateTime<Utc>>,

    #[serde(default)]
    pub last_failure: Option<FailureRecord>,

    pub updated_at: DateTime<Utc>,
}

impl RunJournal {
    /// Creates an empty journal stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            incomplete: BTreeSet::new(),
            completed: BTreeMap::new(),
            last_failure: None,
            updated_at: Utc::now(),
        }
    }

    /// Creates an empty journal in a state directory.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(JOURNAL_FILE))
    }

    /// Loads a journal. A missing file is an empty journal.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            debug!("No journal at {}, starting fresh", path.display());
            return Ok(Self::new(path));
        }

        let content = fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut journal: RunJournal =
            serde_json::from_str(&content).map_err(|source| StateError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        journal.path = path.to_path_buf();

        info!("Loaded journal from {}", path.display());
        if !journal.incomplete.is_empty() {
            info!(
                "{} output(s) left incomplete by a previous run",
                journal.incomplete.len()
            );
        }
        Ok(journal)
    }

    /// Writes the journal, creating its directory if needed.
    pub fn save(&self) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, json).map_err(io_err)?;

        debug!("Saved journal to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records that a job is about to write `output`.
    pub fn mark_started(&mut self, output: &Path) {
        self.incomplete.insert(normalize_path(output));
        self.updated_at = Utc::now();
    }

    /// Records that `output` was produced successfully.
    pub fn mark_completed(&mut self, output: &Path) {
        let output = normalize_path(output);
        self.incomplete.remove(&output);
        self.updated_at = Utc::now();
        self.completed.insert(output, self.updated_at);
    }

    /// Records a failed job. Its output stays incomplete.
    pub fn mark_failed(&mut self, job: &str, output: &Path, message: &str) {
        self.updated_at = Utc::now();
        self.last_failure = Some(FailureRecord {
            job: job.to_string(),
            output: normalize_path(output),
            message: message.to_string(),
            at: self.updated_at,
        });
    }

    /// Outputs that must not be trusted.
    pub fn incomplete_outputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.incomplete.iter()
    }

    /// Returns true if a previous run left work behind.
    pub fn is_resume(&self) -> bool {
        !self.incomplete.is_empty() || self.last_failure.is_some()
    }

    /// Forgets all recorded progress.
    pub fn clear(&mut self) {
        self.incomplete.clear();
        self.completed.clear();
        self.last_failure = None;
        self.updated_at = Utc::now();
    }
}
