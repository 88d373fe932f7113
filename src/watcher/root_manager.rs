//! In-memory set of watched roots.
//!
//! Holds the watcher's mirror of the persisted roots. Pure bookkeeping behind
//! one mutex; never touches the filesystem.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Thread-safe root registry.
#[derive(Debug, Default)]
pub struct RootManager {
    roots: Mutex<BTreeSet<PathBuf>>,
}

impl RootManager {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root. Returns `false` if it was already present.
    pub fn add_root(&self, root: impl Into<PathBuf>) -> bool {
        self.roots.lock().insert(root.into())
    }

    /// Unregister a root. Returns `false` if it was not present.
    pub fn remove_root(&self, root: &Path) -> bool {
        self.roots.lock().remove(root)
    }

    /// Snapshot of all roots.
    #[must_use]
    pub fn get_roots(&self) -> BTreeSet<PathBuf> {
        self.roots.lock().clone()
    }

    /// Whether `root` is registered.
    #[must_use]
    pub fn contains(&self, root: &Path) -> bool {
        self.roots.lock().contains(root)
    }

    /// The deepest registered root containing `path` (component-wise prefix).
    #[must_use]
    pub fn find_root_for_path(&self, path: &Path) -> Option<PathBuf> {
        self.roots
            .lock()
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .cloned()
    }

    /// Whether any registered root contains `path`.
    #[must_use]
    pub fn is_under_any_root(&self, path: &Path) -> bool {
        self.find_root_for_path(path).is_some()
    }

    /// A registered root that contains `candidate` or is contained by it.
    #[must_use]
    pub fn overlapping_root(&self, candidate: &Path) -> Option<PathBuf> {
        self.roots
            .lock()
            .iter()
            .find(|root| root.as_path() != candidate && (candidate.starts_with(root) || root.starts_with(candidate)))
            .cloned()
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Whether no roots are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }
}
