//! Dataset Discovery
//!
//! A dataset is an immediate subdirectory of the input root. The set is
//! computed once per process and handed to the catalog and resolver as
//! a plain value.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::DiscoveryError;

/// Name used on the command line to select every dataset.
pub const ALL_DATASETS: &str = "all";

/// The datasets found under an input root, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datasets {
    root: PathBuf,
    names: Vec<String>,
}

impl Datasets {
    /// Builds a dataset set directly (used by tests and embedders).
    pub fn from_names(root: impl Into<PathBuf>, names: impl IntoIterator<Item = String>) -> Self {
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        names.dedup();
        Self {
            root: root.into(),
            names,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Expands a build request into dataset names.
    ///
    /// `all` selects every dataset; any other name must have been
    /// discovered. Order follows the request, without duplicates.
    pub fn select(&self, requested: &[String]) -> Result<Vec<String>, DiscoveryError> {
        let mut selected: Vec<String> = Vec::new();

        for name in requested {
            if name == ALL_DATASETS {
                for known in &self.names {
                    if !selected.contains(known) {
                        selected.push(known.clone());
                    }
                }
                continue;
            }

            if !self.contains(name) {
                return Err(DiscoveryError::UnknownDataset {
                    name: name.clone(),
                    root: self.root.clone(),
                });
            }
            if !selected.contains(name) {
                selected.push(name.clone());
            }
        }

        Ok(selected)
    }
}

/// Scans `root` for dataset directories.
///
/// Only "is a directory" is checked; contents are not inspected.
pub fn discover_datasets(root: &Path) -> Result<Datasets, DiscoveryError> {
    if !root.exists() {
        return Err(DiscoveryError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }

    let io_err = |source| DiscoveryError::Io {
        root: root.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => {
                debug!("Found dataset: {}", name);
                names.push(name);
            }
            Err(raw) => warn!("Skipping dataset directory with non-UTF-8 name: {:?}", raw),
        }
    }

    let datasets = Datasets::from_names(root, names);
    info!(
        "Discovered {} dataset(s) under {}",
        datasets.len(),
        root.display()
    );
    Ok(datasets)
}
