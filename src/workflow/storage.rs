//! Storage View
//!
//! The resolver only needs to know whether a path exists and when it was
//! last modified. Keeping that behind a trait lets resolution run against
//! an in-memory table in tests.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Read-only view of path existence and modification times.
pub trait Storage {
    fn exists(&self, path: &Path) -> bool;

    fn modified(&self, path: &Path) -> Option<SystemTime>;
}

/// The local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl Storage for LocalStorage {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}
