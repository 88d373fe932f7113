//! One OS observer per watched root.
//!
//! Each root gets its own `notify` watcher so stopping one root drops exactly
//! one observer. Observer callbacks run on notify's threads and only translate
//! and forward notifications over a crossbeam channel.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::clock::Clock;
use super::events::{RawKind, RawNotification};
use super::filter::FileFilter;
use crate::error::WatcherError;
use crate::Result;

/// Message from an observer to the watcher process.
#[derive(Debug, Clone)]
pub enum WatchSignal {
    /// A filtered notification.
    Raw(RawNotification),
    /// The observer for `root` reported an error and should be restarted.
    Failed {
        /// Root whose observer failed.
        root: PathBuf,
        /// Error text from the backend.
        reason: String,
    },
}

/// Translate one backend event into raw notifications.
///
/// Access and metadata-only changes produce nothing.
#[must_use]
pub fn translate(event: &Event, at: std::time::Instant) -> Vec<RawNotification> {
    let single = |kind: RawKind, is_dir: bool| -> Vec<RawNotification> {
        event
            .paths
            .iter()
            .map(|p| RawNotification::new(kind, p.clone(), is_dir, at))
            .collect()
    };

    match event.kind {
        EventKind::Create(kind) => {
            let is_dir = matches!(kind, CreateKind::Folder)
                || event.paths.first().is_some_and(|p| p.is_dir());
            single(RawKind::Created, is_dir)
        }
        EventKind::Remove(kind) => single(RawKind::Deleted, matches!(kind, RemoveKind::Folder)),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to, ..] => vec![RawNotification::moved(from.clone(), to.clone(), to.is_dir(), at)],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(RawKind::Deleted, false),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let is_dir = event.paths.first().is_some_and(|p| p.is_dir());
            single(RawKind::Created, is_dir)
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                if p.exists() {
                    RawNotification::new(RawKind::Created, p.clone(), p.is_dir(), at)
                } else {
                    RawNotification::new(RawKind::Deleted, p.clone(), false, at)
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => Vec::new(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| RawNotification::new(RawKind::Modified, p.clone(), false, at))
            .collect(),
    }
}

/// Rename halves still waiting for their combined event.
///
/// inotify reports a rename as `From`, `To` and then `Both`, all sharing one
/// tracker. The `From` half is still forwarded, because a file moved out of the
/// root never gets a `Both`. The `To` half is dropped when its `From` was seen.
#[derive(Debug, Default)]
struct RenamePairs {
    open: VecDeque<usize>,
}

impl RenamePairs {
    const LIMIT: usize = 256;

    fn admit(&mut self, event: &Event) -> bool {
        let Some(tracker) = event.tracker() else {
            return true;
        };
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if self.open.len() == Self::LIMIT {
                    self.open.pop_front();
                }
                self.open.push_back(tracker);
                true
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => !self.open.contains(&tracker),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                self.open.retain(|t| *t != tracker);
                true
            }
            _ => true,
        }
    }
}

fn keep(filter: &FileFilter, raw: &RawNotification) -> bool {
    let src_ok = filter.accepts(&raw.src_path, raw.is_directory);
    match &raw.dest_path {
        Some(dest) => src_ok || filter.accepts(dest, raw.is_directory),
        None => src_ok,
    }
}

/// Pool of per-root observers.
pub struct FSWatcherPool {
    observers: Mutex<HashMap<PathBuf, RecommendedWatcher>>,
    sender: Sender<WatchSignal>,
    ignore_patterns: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl FSWatcherPool {
    /// Create a pool forwarding to `sender`.
    #[must_use]
    pub fn new(sender: Sender<WatchSignal>, ignore_patterns: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            sender,
            ignore_patterns,
            clock,
        }
    }

    /// Start a recursive observer for `root`.
    ///
    /// Returns `false` if the root is already being watched.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is not an existing directory or the
    /// backend refuses the watch.
    pub fn start_watching(&self, root: &Path) -> Result<bool> {
        if self.observers.lock().contains_key(root) {
            return Ok(false);
        }
        if !root.is_dir() {
            return Err(WatcherError::WatchFailed {
                path: root.display().to_string(),
                reason: "not a directory".to_string(),
            }
            .into());
        }

        let filter = FileFilter::new(root, &self.ignore_patterns)?;
        let sender = self.sender.clone();
        let clock = Arc::clone(&self.clock);
        let owner = root.to_path_buf();
        let mut renames = RenamePairs::default();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !renames.admit(&event) {
                    return;
                }
                for raw in translate(&event, clock.now()) {
                    if keep(&filter, &raw) && sender.send(WatchSignal::Raw(raw)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(root = %owner.display(), error = %e, "Observer error");
                let _ = sender.send(WatchSignal::Failed {
                    root: owner.clone(),
                    reason: e.to_string(),
                });
            }
        })
        .map_err(|e| WatcherError::WatchFailed {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchFailed {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;

        self.observers.lock().insert(root.to_path_buf(), watcher);
        tracing::info!(root = %root.display(), "Watching root");
        Ok(true)
    }

    /// Drop the observer for `root`. Returns `false` if none existed.
    pub fn stop_watching(&self, root: &Path) -> bool {
        let removed = self.observers.lock().remove(root);
        match removed {
            Some(mut watcher) => {
                let _ = watcher.unwatch(root);
                tracing::info!(root = %root.display(), "Stopped watching root");
                true
            }
            None => false,
        }
    }

    /// Replace a failed observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the new observer cannot be started.
    pub fn restart(&self, root: &Path) -> Result<bool> {
        self.stop_watching(root);
        self.start_watching(root)
    }

    /// Drop every observer.
    pub fn stop_all(&self) {
        let drained: Vec<(PathBuf, RecommendedWatcher)> = self.observers.lock().drain().collect();
        for (root, mut watcher) in drained {
            let _ = watcher.unwatch(&root);
        }
    }

    /// Whether `root` has an observer.
    #[must_use]
    pub fn is_watching(&self, root: &Path) -> bool {
        self.observers.lock().contains_key(root)
    }

    /// Roots with observers, sorted.
    #[must_use]
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.observers.lock().keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Number of observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Whether no observers are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }
}

impl std::fmt::Debug for FSWatcherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FSWatcherPool")
            .field("roots", &self.watched_roots())
            .finish_non_exhaustive()
    }
}

impl Drop for FSWatcherPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}
