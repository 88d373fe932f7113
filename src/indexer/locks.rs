//! Per-path serialization for the indexer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockMap = Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>;

/// Async locks keyed by path. Two holders never work on the same path at once.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    inner: LockMap,
}

/// Held while a set of paths is being processed. Releases on drop.
#[derive(Debug)]
pub struct PathGuard {
    map: LockMap,
    paths: Vec<PathBuf>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl PathLocks {
    /// Empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every path in `paths`.
    ///
    /// Paths are locked in sorted order, so two callers locking overlapping
    /// sets cannot deadlock.
    pub async fn lock(&self, paths: &[&Path]) -> PathGuard {
        let mut sorted: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        sorted.sort();
        sorted.dedup();

        let mutexes: Vec<_> = {
            let mut map = self.inner.lock();
            sorted
                .iter()
                .map(|p| Arc::clone(map.entry(p.clone()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }

        PathGuard {
            map: Arc::clone(&self.inner),
            paths: sorted,
            guards,
        }
    }

    /// Number of paths currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no path is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut map = self.map.lock();
        for path in &self.paths {
            if map.get(path).is_some_and(|m| Arc::strong_count(m) == 1) {
                map.remove(path);
            }
        }
    }
}
