//! Watcher event and command types.

#![allow(clippy::missing_const_for_fn)]

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What the OS reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// Path appeared.
    Created,
    /// Path disappeared.
    Deleted,
    /// Content changed.
    Modified,
    /// Path renamed, both ends known.
    Moved,
}

/// An unprocessed filesystem notification.
///
/// Lives only until the processor has correlated and debounced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Kind of change.
    pub kind: RawKind,
    /// Affected path (the source for moves).
    pub src_path: PathBuf,
    /// Destination for moves.
    pub dest_path: Option<PathBuf>,
    /// Whether the path is (or was) a directory, as far as the OS said.
    pub is_directory: bool,
    /// When the notification was observed.
    pub at: Instant,
}

impl RawNotification {
    /// Build a notification without a destination.
    #[must_use]
    pub fn new(kind: RawKind, path: impl Into<PathBuf>, is_directory: bool, at: Instant) -> Self {
        Self {
            kind,
            src_path: path.into(),
            dest_path: None,
            is_directory,
            at,
        }
    }

    /// Build a move notification.
    #[must_use]
    pub fn moved(
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        is_directory: bool,
        at: Instant,
    ) -> Self {
        Self {
            kind: RawKind::Moved,
            src_path: from.into(),
            dest_path: Some(to.into()),
            is_directory,
            at,
        }
    }
}

/// Semantic change kind delivered to the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    /// New file.
    Add,
    /// File removed.
    Delete,
    /// Content replaced.
    Update,
    /// File renamed; `old_path` says from where.
    Move,
}

impl FileEventKind {
    /// Lowercase name, used for metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Update => "update",
            Self::Move => "move",
        }
    }
}

/// A deduplicated, move-aware change to one file.
///
/// `path` always lies under `root`; for moves `old_path` lies under `old_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Kind of change.
    pub kind: FileEventKind,
    /// Affected path (the destination for moves).
    pub path: PathBuf,
    /// Root containing `path`.
    pub root: PathBuf,
    /// Previous path for moves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,
    /// Root containing `old_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_root: Option<PathBuf>,
    /// Unix millis when the change was first seen.
    pub timestamp: i64,
}

impl FileEvent {
    /// Add event.
    #[must_use]
    pub fn add(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::simple(FileEventKind::Add, path, root)
    }

    /// Update event.
    #[must_use]
    pub fn update(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::simple(FileEventKind::Update, path, root)
    }

    /// Delete event.
    #[must_use]
    pub fn delete(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::simple(FileEventKind::Delete, path, root)
    }

    /// Move event.
    #[must_use]
    pub fn moved(
        old_path: impl Into<PathBuf>,
        old_root: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: FileEventKind::Move,
            path: path.into(),
            root: root.into(),
            old_path: Some(old_path.into()),
            old_root: Some(old_root.into()),
            timestamp: now_millis(),
        }
    }

    fn simple(kind: FileEventKind, path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            root: root.into(),
            old_path: None,
            old_root: None,
            timestamp: now_millis(),
        }
    }

    /// Paths this event touches (the old path first for moves).
    #[must_use]
    pub fn touched_paths(&self) -> Vec<&Path> {
        match &self.old_path {
            Some(old) => vec![old.as_path(), self.path.as_path()],
            None => vec![self.path.as_path()],
        }
    }
}

/// Control message for the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Start watching `root`.
    AddRoot,
    /// Stop watching `root`.
    RemoveRoot,
    /// Stop the watcher.
    Shutdown,
}

/// A queued instruction from the indexer to the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherCommand {
    /// What to do.
    pub kind: CommandKind,
    /// Target root for add/remove.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Unix millis when issued.
    pub timestamp: i64,
}

impl WatcherCommand {
    /// `AddRoot` command.
    #[must_use]
    pub fn add_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: CommandKind::AddRoot,
            root: Some(root.into()),
            timestamp: now_millis(),
        }
    }

    /// `RemoveRoot` command.
    #[must_use]
    pub fn remove_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: CommandKind::RemoveRoot,
            root: Some(root.into()),
            timestamp: now_millis(),
        }
    }

    /// `Shutdown` command.
    #[must_use]
    pub fn shutdown() -> Self {
        Self {
            kind: CommandKind::Shutdown,
            root: None,
            timestamp: now_millis(),
        }
    }
}
