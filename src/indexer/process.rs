//! The indexer process: owns the roots and keeps the store in sync with them.
//!
//! File events are consumed from the durable queue in batches. Events that
//! touch a common path run one after another in queue order; unrelated paths
//! run concurrently, up to `max_concurrent_files`. A batch is acknowledged only
//! after every event in it has been applied, so a crash replays it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::chunker::Chunker;
use super::locks::PathLocks;
use super::parsers::ParserRegistry;
use crate::config::{Config, IndexerConfig};
use crate::embeddings::{estimate_tokens, Embedder};
use crate::error::{Error, ParseError, StorageError, WatcherError};
use crate::queue::QueueItem;
use crate::server::metrics::{
    CHUNKS_TOTAL, COMMAND_QUEUE_DEPTH, DOCUMENTS_TOTAL, EVENTS_PROCESSED, EVENT_QUEUE_DEPTH,
    INDEX_FAILURES,
};
use crate::storage::{
    clear_failure, count_chunks_for_document, delete_root, document_paths_under, due_failures,
    get_root, insert_root, list_documents, list_failures, list_roots, log_activity,
    recent_activity, record_failure, set_root_enabled, weighted_mean, ActivityEntry, ChunkRecord,
    Database, DocumentRecord, DocumentSearchResult, DocumentWrite, EmbeddedChunk, FailedFile,
    RootRecord, SearchOptions, SearchResult, StoreStats, VectorStore,
};
use crate::watcher::{FileEvent, FileEventKind, FileFilter, RootManager, WatcherClient};
use crate::Result;

/// Pause after a batch in which something was requeued.
const TRANSIENT_PAUSE: Duration = Duration::from_secs(5);
/// How often the failed-file schedule is checked.
const RETRY_SCAN: Duration = Duration::from_secs(10);
/// A truncated final context part needs at least this much room.
const CONTEXT_MIN_TAIL: usize = 100;
const CONTEXT_SEPARATOR: &str = "\n---\n";

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn path_key(path: &Path) -> String {
    path.display().to_string()
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(|| path_key(path), |n| n.to_string_lossy().into_owned())
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// Not started, or fully stopped.
    Stopped,
    /// Loading roots and recovering the queue.
    Starting,
    /// Consuming events.
    Running,
    /// Finishing in-flight work.
    Stopping,
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    /// Parsed, chunked, embedded and stored.
    Indexed {
        /// Chunks written.
        chunks: usize,
    },
    /// Content hash matched the stored document; nothing written.
    Unchanged,
    /// Outside every enabled root, filtered out, or no parser for it.
    Skipped,
    /// The file is gone; any stored copy was removed.
    Missing,
}

/// Counts from a resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Roots walked.
    pub roots: usize,
    /// Files indexed for the first time.
    pub added: usize,
    /// Files re-indexed because their content changed.
    pub updated: usize,
    /// Documents removed because their file is gone.
    pub removed: usize,
    /// Files already current.
    pub unchanged: usize,
    /// Files that failed and were scheduled for retry.
    pub failed: usize,
}

impl ResyncReport {
    fn absorb(&mut self, other: Self) {
        self.roots += other.roots;
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// Differences between the enabled roots on disk and the store. Nothing is repaired.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    /// Enabled roots checked.
    pub roots: Vec<String>,
    /// Indexable files on disk, per root.
    pub files_by_root: BTreeMap<String, usize>,
    /// Files on disk with no document.
    pub missing_from_index: Vec<String>,
    /// Documents whose file is gone or outside every root.
    pub orphaned_in_index: Vec<String>,
    /// Documents whose file content no longer matches the stored hash.
    pub modified: Vec<String>,
    /// Documents whose recorded chunk count differs from the stored chunks.
    pub chunk_count_mismatches: Vec<String>,
    /// Sum of all the lists above.
    pub total_issues: usize,
    /// Store row counts at check time.
    pub stats: StoreStats,
}

/// Snapshot for `/api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStats {
    /// Store row counts.
    #[serde(flatten)]
    pub store: StoreStats,
    /// Indexer lifecycle state.
    pub state: IndexerState,
    /// Whether the watcher reports itself running.
    pub watcher_running: bool,
    /// Events waiting for the indexer.
    pub pending_events: u64,
    /// Commands waiting for the watcher.
    pub pending_commands: u64,
    /// Embedding model in use.
    pub model_id: String,
    /// Vector width.
    pub dimensions: usize,
}

enum Admission {
    Accept,
    Disabled,
    Reject,
}

struct RootFilter {
    enabled: bool,
    filter: FileFilter,
}

/// Everything the loops, scans and API calls share.
struct Inner {
    db: Database,
    store: VectorStore,
    client: WatcherClient,
    parsers: ParserRegistry,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    config: IndexerConfig,
    ignore_patterns: Vec<String>,
    locks: PathLocks,
    roots: RootManager,
    filters: RwLock<HashMap<PathBuf, RootFilter>>,
    /// Held for reading while a file is processed, for writing while a root is removed.
    gate: tokio::sync::RwLock<()>,
}

impl Inner {
    fn build_filter(&self, record: &RootRecord) -> Result<FileFilter> {
        let root = record.path_buf();
        let mut patterns = self.ignore_patterns.clone();
        patterns.extend(record.exclude_patterns.iter().cloned());
        match FileFilter::new(&root, &patterns).and_then(|f| f.with_includes(&record.include_patterns)) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                tracing::warn!(root = %record.path, error = %e, "Invalid root patterns, using global ignores");
                FileFilter::new(&root, &self.ignore_patterns)
            }
        }
    }

    /// Rebuild the in-memory root view from the database.
    fn reload_roots(&self) -> Result<()> {
        let records = self.db.with_conn(|conn| list_roots(conn, false))?;
        let mut filters = HashMap::with_capacity(records.len());
        for record in &records {
            let filter = self.build_filter(record)?;
            filters.insert(
                record.path_buf(),
                RootFilter {
                    enabled: record.enabled,
                    filter,
                },
            );
        }

        for root in self.roots.get_roots() {
            self.roots.remove_root(&root);
        }
        for record in &records {
            self.roots.add_root(record.path_buf());
        }
        *self.filters.write() = filters;
        Ok(())
    }

    fn admission(&self, path: &Path) -> Admission {
        let Some(root) = self.roots.find_root_for_path(path) else {
            return Admission::Reject;
        };
        let filters = self.filters.read();
        match filters.get(&root) {
            Some(f) if !f.enabled => Admission::Disabled,
            Some(f) if f.filter.accepts(path, false) && self.parsers.can_parse(path) => {
                Admission::Accept
            }
            _ => Admission::Reject,
        }
    }

    fn filter_for(&self, root: &Path) -> Option<FileFilter> {
        self.filters.read().get(root).map(|f| f.filter.clone())
    }

    fn disabled_roots(&self) -> Vec<String> {
        self.filters
            .read()
            .iter()
            .filter(|(_, f)| !f.enabled)
            .map(|(root, _)| path_key(root))
            .collect()
    }

    fn with_disabled_roots(&self, mut options: SearchOptions) -> SearchOptions {
        for root in self.disabled_roots() {
            if !options.exclude_roots.contains(&root) {
                options.exclude_roots.push(root);
            }
        }
        options
    }

    /// Indexable files under `root`, sorted. A missing root yields nothing.
    async fn list_files(self: &Arc<Self>, root: &Path) -> Result<Vec<PathBuf>> {
        let Some(filter) = self.filter_for(root) else {
            return Ok(Vec::new());
        };
        let inner = Arc::clone(self);
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut files: Vec<PathBuf> = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !filter.is_ignored(e.path(), e.file_type().is_dir()))
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(walkdir::DirEntry::into_path)
                .filter(|p| filter.accepts(p, false) && inner.parsers.can_parse(p))
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| Error::internal(format!("directory walk failed: {e}")))
    }

    /// Run synchronous database work on the blocking pool.
    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::internal(format!("blocking task failed: {e}")))?
    }

    /// Insert the root row and tell the watcher. `Ok(false)` if it already exists.
    fn register_root(&self, root: &Path, key: &str) -> Result<bool> {
        if self.db.with_conn(|conn| get_root(conn, key))?.is_some() {
            return Ok(false);
        }
        if let Some(existing) = self.roots.overlapping_root(root) {
            let relation = if root.starts_with(&existing) {
                "is already inside the managed folder"
            } else {
                "contains the already-managed folder"
            };
            return Err(StorageError::conflict(
                "root",
                format!("'{key}' {relation} '{}'", existing.display()),
            )
            .into());
        }

        let message = format!("Added document folder: {}", display_name(root));
        self.db.with_transaction(|conn| {
            insert_root(conn, &RootRecord::new(key.to_string()))?;
            log_activity(conn, "root_added", &message, Some(key))
        })?;
        self.reload_roots()?;
        self.client.add_root(root)?;
        Ok(true)
    }

    /// Drop a root's documents, then its row, then tell the watcher.
    /// Returns the documents and chunks removed.
    fn unregister_root(&self, root: &Path, key: &str) -> Result<(usize, usize)> {
        if self.db.with_conn(|conn| get_root(conn, key))?.is_none() {
            return Err(StorageError::not_found("root", key.to_string()).into());
        }

        let (documents, chunks) = self.store.remove_documents_under(key)?;
        let message = format!(
            "Removed document folder: {} ({documents} documents)",
            display_name(root)
        );
        self.db.with_transaction(|conn| {
            delete_root(conn, key)?;
            log_activity(conn, "root_removed", &message, Some(key))
        })?;
        self.reload_roots()?;
        self.client.remove_root(root)?;
        self.refresh_gauges();
        Ok((documents, chunks))
    }

    fn clear_failure(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| clear_failure(conn, key))
    }

    fn note_failure(&self, path: &Path, error: &Error) {
        if let Error::Parse(ParseError::Unsupported { .. }) = error {
            tracing::warn!(path = %path.display(), "No parser for file");
            return;
        }
        INDEX_FAILURES.inc();
        let key = path_key(path);
        let message = format!("Failed to index {}: {error}", display_name(path));
        let result = self.db.with_transaction(|conn| {
            record_failure(conn, &key, &error.to_string(), self.config.retry_failed_after_seconds)?;
            log_activity(conn, "index_failed", &message, Some(&key))
        });
        match result {
            Ok(()) => tracing::warn!(
                path = %path.display(),
                error = %error,
                retry_in = self.config.retry_failed_after_seconds,
                "Indexing failed, retry scheduled"
            ),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to record index failure"),
        }
    }

    /// Embedding for the whole document: the full text when it fits the
    /// model, otherwise the length-weighted mean of the chunk vectors.
    async fn document_vector(&self, content: &str, chunks: &[ChunkRecord], vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
        if vectors.len() <= 1 {
            return vectors.first().cloned();
        }
        if estimate_tokens(content) * 10 <= self.embedder.max_tokens() * 9 {
            match self.embedder.embed_single(content).await {
                Ok(vector) => return Some(vector),
                Err(e) => tracing::debug!(error = %e, "Full-text embedding failed, using chunk mean"),
            }
        }
        let parts: Vec<(&[f32], usize)> = vectors
            .iter()
            .zip(chunks)
            .map(|(v, c)| (v.as_slice(), c.content.chars().count()))
            .collect();
        weighted_mean(&parts)
    }

    /// Bring one path's document up to date. Caller holds the gate and the path lock.
    async fn index_locked(self: &Arc<Self>, path: &Path) -> Result<IndexOutcome> {
        let key = path_key(path);
        let outcome = self.index_inner(path, &key).await?;
        self.clear_failure(&key)?;
        Ok(outcome)
    }

    async fn index_inner(self: &Arc<Self>, path: &Path, key: &str) -> Result<IndexOutcome> {
        match self.admission(path) {
            Admission::Accept => {}
            Admission::Disabled => return Ok(IndexOutcome::Skipped),
            Admission::Reject => {
                if self.store.get_document(key)?.is_some() {
                    self.store.remove_document(key)?;
                    tracing::debug!(path = %key, "Dropped document that is no longer indexable");
                }
                return Ok(IndexOutcome::Skipped);
            }
        }
        if path.is_dir() {
            return Ok(IndexOutcome::Skipped);
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.store.remove_document(key)?;
                return Ok(IndexOutcome::Missing);
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(path = %key, "Permission denied, skipping file");
                return Ok(IndexOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let hash = blake3::hash(&bytes).to_hex().to_string();
        if self.store.document_is_current(key, &hash)? {
            tracing::debug!(path = %key, "Content unchanged");
            return Ok(IndexOutcome::Unchanged);
        }

        let inner = Arc::clone(self);
        let owned = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || inner.parsers.parse_bytes(&owned, &bytes))
            .await
            .map_err(|e| Error::internal(format!("parser task failed: {e}")))??;

        let chunks = self.chunker.chunk(&parsed);
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        let document_vector = self.document_vector(&parsed.content, &chunks, &vectors).await;

        let now = unix_now();
        let chunk_count = chunks.len();
        let write = DocumentWrite {
            document: DocumentRecord {
                path: key.to_string(),
                content_hash: hash,
                file_type: parsed.file_type,
                metadata: parsed.metadata,
                chunk_count,
                model_id: self.store.model_id().to_string(),
                parsed_at: now,
                updated_at: now,
            },
            chunks: chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
                .collect(),
            document_vector,
            dimensions: self.store.dimensions(),
        };
        self.store.replace_document(&write)?;

        tracing::info!(path = %key, chunks = chunk_count, "Indexed document");
        Ok(IndexOutcome::Indexed { chunks: chunk_count })
    }

    fn remove_locked(&self, path: &Path) -> Result<usize> {
        let key = path_key(path);
        let chunks = self.store.remove_document(&key)?;
        self.clear_failure(&key)?;
        tracing::debug!(path = %key, chunks, "Removed document");
        Ok(chunks)
    }

    async fn move_locked(self: &Arc<Self>, old: &Path, new: &Path) -> Result<()> {
        let renamed = matches!(self.admission(new), Admission::Accept)
            && self.store.rename_document(&path_key(old), &path_key(new))?;
        if renamed {
            self.clear_failure(&path_key(old))?;
            tracing::debug!(from = %old.display(), to = %new.display(), "Moved document");
        } else {
            self.remove_locked(old)?;
        }
        // Content may have changed alongside the rename.
        self.index_locked(new).await.map(drop)
    }

    async fn apply(self: &Arc<Self>, event: &FileEvent) -> Result<()> {
        match (event.kind, event.old_path.as_deref()) {
            (FileEventKind::Delete, _) => self.remove_locked(&event.path).map(drop),
            (FileEventKind::Move, Some(old)) => self.move_locked(old, &event.path).await,
            _ => self.index_locked(&event.path).await.map(drop),
        }
    }

    async fn handle_event(self: &Arc<Self>, event: &FileEvent) -> Result<()> {
        let _gate = self.gate.read().await;
        let _guard = self.locks.lock(&event.touched_paths()).await;
        self.apply(event).await
    }

    /// Apply one group in order. After a requeue the rest of the group is
    /// requeued too, so later events never overtake earlier ones.
    async fn process_group(self: &Arc<Self>, group: Vec<QueueItem<FileEvent>>) -> (Vec<i64>, Vec<i64>) {
        let mut acks = Vec::with_capacity(group.len());
        let mut nacks = Vec::new();
        for item in group {
            if !nacks.is_empty() {
                nacks.push(item.id);
                continue;
            }
            let event = &item.payload;
            match self.handle_event(event).await {
                Ok(()) => {
                    EVENTS_PROCESSED.with_label_values(&[event.kind.as_str()]).inc();
                    acks.push(item.id);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(path = %event.path.display(), kind = event.kind.as_str(), error = %e, "Event requeued");
                    nacks.push(item.id);
                }
                Err(e) => {
                    self.note_failure(&event.path, &e);
                    acks.push(item.id);
                }
            }
        }
        (acks, nacks)
    }

    /// Consume one batch. Returns `(applied, requeued)`.
    async fn process_batch(self: &Arc<Self>) -> Result<(usize, usize)> {
        let items = self.client.next_events(self.config.event_batch_size)?;
        if items.is_empty() {
            return Ok((0, 0));
        }

        let results: Vec<(Vec<i64>, Vec<i64>)> = stream::iter(group_by_path(items))
            .map(|group| self.process_group(group))
            .buffer_unordered(self.config.max_concurrent_files.max(1))
            .collect()
            .await;

        let (acks, nacks): (Vec<i64>, Vec<i64>) = results.into_iter().fold(
            (Vec::new(), Vec::new()),
            |(mut acks, mut nacks), (a, n)| {
                acks.extend(a);
                nacks.extend(n);
                (acks, nacks)
            },
        );
        self.client.ack(&acks)?;
        self.client.nack(&nacks)?;
        self.refresh_gauges();

        tracing::debug!(applied = acks.len(), requeued = nacks.len(), "Event batch done");
        Ok((acks.len(), nacks.len()))
    }

    /// Index one file through the lock table, recording any failure.
    async fn index_file(self: &Arc<Self>, path: &Path) -> Result<IndexOutcome> {
        let result = {
            let _gate = self.gate.read().await;
            let _guard = self.locks.lock(&[path]).await;
            self.index_locked(path).await
        };
        if let Err(e) = &result {
            self.note_failure(path, e);
        }
        result
    }

    async fn remove_file(&self, path: &Path) -> Result<usize> {
        let _gate = self.gate.read().await;
        let _guard = self.locks.lock(&[path]).await;
        self.remove_locked(path)
    }

    async fn resync_root(self: &Arc<Self>, root: &Path, cancel: &CancellationToken) -> Result<ResyncReport> {
        let on_disk = self.list_files(root).await?;
        let disk_keys: HashSet<String> = on_disk.iter().map(|p| path_key(p)).collect();
        let indexed: HashSet<String> = self
            .db
            .with_conn(|conn| document_paths_under(conn, &path_key(root)))?
            .into_iter()
            .map(|(path, _)| path)
            .collect();

        let mut report = ResyncReport {
            roots: 1,
            ..ResyncReport::default()
        };
        for gone in indexed.iter().filter(|p| !disk_keys.contains(*p)) {
            self.remove_file(Path::new(gone)).await?;
            report.removed += 1;
        }
        for file in &on_disk {
            if cancel.is_cancelled() {
                tracing::info!(root = %root.display(), "Resync interrupted");
                break;
            }
            let existed = indexed.contains(&path_key(file));
            match self.index_file(file).await {
                Ok(IndexOutcome::Indexed { .. }) if existed => report.updated += 1,
                Ok(IndexOutcome::Indexed { .. }) => report.added += 1,
                Ok(IndexOutcome::Unchanged) => report.unchanged += 1,
                Ok(IndexOutcome::Skipped | IndexOutcome::Missing) => {}
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn resync(self: &Arc<Self>, cancel: &CancellationToken) -> Result<ResyncReport> {
        let roots = self.db.with_conn(|conn| list_roots(conn, true))?;
        let mut report = ResyncReport::default();
        for root in &roots {
            report.absorb(self.resync_root(&root.path_buf(), cancel).await?);
        }

        let documents = self.db.with_conn(|conn| list_documents(conn, None, usize::MAX, 0))?;
        for doc in documents {
            if !self.roots.is_under_any_root(Path::new(&doc.path)) {
                self.remove_file(Path::new(&doc.path)).await?;
                report.removed += 1;
            }
        }

        let message = format!(
            "Resync complete: {} added, {} removed, {} updated",
            report.added, report.removed, report.updated
        );
        self.db.with_conn(|conn| log_activity(conn, "resync", &message, None))?;
        self.refresh_gauges();
        tracing::info!(
            roots = report.roots,
            added = report.added,
            removed = report.removed,
            updated = report.updated,
            failed = report.failed,
            "Resync complete"
        );
        Ok(report)
    }

    async fn retry_failed(self: &Arc<Self>) -> Result<usize> {
        let due = self.db.with_conn(|conn| due_failures(conn, unix_now()))?;
        let mut recovered = 0;
        for failed in due {
            let path = PathBuf::from(&failed.path);
            tracing::debug!(path = %failed.path, attempts = failed.attempts, "Retrying failed file");
            if self.index_file(&path).await.is_ok() {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered previously failed files");
        }
        Ok(recovered)
    }

    /// Delete acknowledged queue rows. Returns how many went.
    fn purge_queues(&self) -> usize {
        match self.client.purge_done() {
            Ok(0) => 0,
            Ok(purged) => {
                tracing::debug!(purged, "Purged acknowledged queue rows");
                purged
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge queues");
                0
            }
        }
    }

    fn refresh_gauges(&self) {
        match self.store.stats() {
            Ok(stats) => {
                DOCUMENTS_TOTAL.set(gauge_value(stats.documents));
                CHUNKS_TOTAL.set(gauge_value(stats.chunks));
            }
            Err(e) => tracing::debug!(error = %e, "Failed to read store stats"),
        }
        if let Ok(events) = self.client.pending_events() {
            EVENT_QUEUE_DEPTH.set(gauge_value(events));
        }
        if let Ok(commands) = self.client.pending_commands() {
            COMMAND_QUEUE_DEPTH.set(gauge_value(commands));
        }
    }
}

/// Split a batch so that events sharing any path land in the same group,
/// in queue order.
fn group_by_path(items: Vec<QueueItem<FileEvent>>) -> Vec<Vec<QueueItem<FileEvent>>> {
    let mut groups: Vec<Vec<QueueItem<FileEvent>>> = Vec::new();
    let mut owner: HashMap<PathBuf, usize> = HashMap::new();

    for item in items {
        let paths: Vec<PathBuf> = item.payload.touched_paths().iter().map(|p| p.to_path_buf()).collect();
        let mut targets: Vec<usize> = paths.iter().filter_map(|p| owner.get(p).copied()).collect();
        targets.sort_unstable();
        targets.dedup();

        let index = match targets.split_first() {
            None => {
                groups.push(Vec::new());
                groups.len() - 1
            }
            Some((&first, rest)) => {
                for &other in rest {
                    let merged = std::mem::take(&mut groups[other]);
                    for m in &merged {
                        for p in m.payload.touched_paths() {
                            owner.insert(p.to_path_buf(), first);
                        }
                    }
                    groups[first].extend(merged);
                }
                groups[first].sort_by_key(|i| i.id);
                first
            }
        };
        for p in paths {
            owner.insert(p, index);
        }
        groups[index].push(item);
    }

    groups.retain(|g| !g.is_empty());
    groups
}

/// Consumes file events and serves the query side.
pub struct IndexerProcess {
    inner: Arc<Inner>,
    state: Mutex<IndexerState>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scans: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexerProcess {
    /// Create a stopped indexer on its own database handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue tables or roots cannot be read.
    pub fn new(db: Database, config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::with_parsers(db, config, embedder, ParserRegistry::with_defaults())
    }

    /// Like [`Self::new`] with a custom parser registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue tables or roots cannot be read.
    pub fn with_parsers(
        db: Database,
        config: &Config,
        embedder: Arc<dyn Embedder>,
        parsers: ParserRegistry,
    ) -> Result<Self> {
        let inner = Inner {
            store: VectorStore::new(db.clone(), embedder.model_id(), embedder.dimensions()),
            client: WatcherClient::open(db.clone())?,
            parsers,
            chunker: Chunker::new(config.chunking.clone()),
            embedder,
            config: config.indexer.clone(),
            ignore_patterns: config.watcher.ignore_patterns.clone(),
            locks: PathLocks::new(),
            roots: RootManager::new(),
            filters: RwLock::new(HashMap::new()),
            gate: tokio::sync::RwLock::new(()),
            db,
        };
        inner.reload_roots()?;

        Ok(Self {
            inner: Arc::new(inner),
            state: Mutex::new(IndexerState::Stopped),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            scans: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IndexerState {
        *self.state.lock()
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == IndexerState::Running
    }

    /// The store this indexer writes.
    #[must_use]
    pub fn store(&self) -> &VectorStore {
        &self.inner.store
    }

    /// The indexer's database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// The queue-side handle to the watcher.
    #[must_use]
    pub fn watcher(&self) -> &WatcherClient {
        &self.inner.client
    }

    /// Recover in-flight events, then spawn the event and retry loops and,
    /// if configured, a resync.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` unless stopped, or a storage error.
    pub fn start_async(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != IndexerState::Stopped {
                return Err(WatcherError::AlreadyRunning.into());
            }
            *state = IndexerState::Starting;
        }

        let loaded = self.inner.reload_roots().and_then(|()| self.inner.client.requeue_unacked());
        let requeued = match loaded {
            Ok(n) => n,
            Err(e) => {
                *self.state.lock() = IndexerState::Stopped;
                return Err(e);
            }
        };
        if requeued > 0 {
            tracing::info!(events = requeued, "Requeued unacknowledged events");
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.tasks.lock() = vec![
            self.spawn_event_loop(cancel.clone()),
            self.spawn_retry_loop(cancel),
        ];
        if self.inner.config.resync_on_start {
            self.spawn_resync();
        }

        *self.state.lock() = IndexerState::Running;
        tracing::info!(
            roots = self.inner.roots.len(),
            workers = self.inner.config.max_concurrent_files,
            "Indexer running"
        );
        Ok(())
    }

    fn spawn_event_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = inner.config.process_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let requeued = match inner.process_batch().await {
                            Ok((_, requeued)) => requeued,
                            Err(e) => {
                                tracing::error!(error = %e, "Event batch failed");
                                1
                            }
                        };
                        if requeued > 0 {
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                () = tokio::time::sleep(TRANSIENT_PAUSE) => {}
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_retry_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRY_SCAN);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = inner.retry_failed().await {
                            tracing::error!(error = %e, "Failed-file retry failed");
                        }
                        inner.purge_queues();
                    }
                }
            }
        })
    }

    fn track_scan(&self, handle: JoinHandle<()>) {
        let mut scans = self.scans.lock();
        scans.retain(|h| !h.is_finished());
        scans.push(handle);
    }

    fn spawn_resync(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.lock().clone();
        self.track_scan(tokio::spawn(async move {
            if let Err(e) = inner.resync(&cancel).await {
                tracing::error!(error = %e, "Resync failed");
            }
        }));
    }

    fn spawn_root_scan(&self, root: PathBuf) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.lock().clone();
        self.track_scan(tokio::spawn(async move {
            match inner.resync_root(&root, &cancel).await {
                Ok(report) => {
                    inner.refresh_gauges();
                    tracing::info!(
                        root = %root.display(),
                        added = report.added,
                        updated = report.updated,
                        removed = report.removed,
                        "Root scan complete"
                    );
                }
                Err(e) => tracing::error!(root = %root.display(), error = %e, "Root scan failed"),
            }
        }));
    }

    /// Wait for background root scans and resyncs to finish.
    pub async fn wait_for_scans(&self) {
        loop {
            let scans: Vec<JoinHandle<()>> = std::mem::take(&mut *self.scans.lock());
            if scans.is_empty() {
                return;
            }
            for scan in scans {
                if let Err(e) = scan.await {
                    tracing::error!(error = %e, "Scan task failed");
                }
            }
        }
    }

    /// Resolves once the indexer has been asked to stop.
    pub async fn wait_for_shutdown(&self) {
        let cancel = self.cancel.lock().clone();
        cancel.cancelled().await;
    }

    /// Start, run until [`Self::stop`] is requested, then stop.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails.
    pub async fn run(&self) -> Result<()> {
        self.start_async()?;
        self.wait_for_shutdown().await;
        self.stop().await
    }

    /// Stop the loops. In-flight files finish; unapplied events stay queued.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the indexer was not running.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != IndexerState::Running {
                return Err(WatcherError::NotRunning.into());
            }
            *state = IndexerState::Stopping;
        }

        self.cancel.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Indexer task failed");
            }
        }
        self.wait_for_scans().await;
        *self.cancel.lock() = CancellationToken::new();

        *self.state.lock() = IndexerState::Stopped;
        tracing::info!("Indexer stopped");
        Ok(())
    }

    /// Register a root, tell the watcher about it and scan it in the background.
    ///
    /// Returns `false` without changing anything if the root already exists.
    ///
    /// # Errors
    ///
    /// `RootNotFound` if the directory does not exist, `Conflict` if it nests
    /// with an existing root, or a storage error.
    pub async fn add_root(&self, path: &Path) -> Result<bool> {
        let root = std::fs::canonicalize(path)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| WatcherError::RootNotFound(path.display().to_string()))?;
        let key = path_key(&root);

        let gate = self.inner.gate.write().await;
        let added = {
            let (root, key) = (root.clone(), key.clone());
            self.inner.blocking(move |inner| inner.register_root(&root, &key)).await?
        };
        drop(gate);
        if !added {
            tracing::debug!(root = %key, "Root already registered");
            return Ok(false);
        }

        tracing::info!(root = %key, "Root added");
        self.spawn_root_scan(root);
        Ok(true)
    }

    /// Remove a root: its documents first, then the row, then the watcher command.
    ///
    /// Returns the number of documents removed.
    ///
    /// # Errors
    ///
    /// `NotFound` if the root is not registered, or a storage error.
    pub async fn remove_root(&self, path: &Path) -> Result<usize> {
        let root = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let key = path_key(&root);

        let (documents, chunks) = {
            let _gate = self.inner.gate.write().await;
            let key = key.clone();
            self.inner.blocking(move |inner| inner.unregister_root(&root, &key)).await?
        };

        tracing::info!(root = %key, documents, chunks, "Root removed");
        Ok(documents)
    }

    /// Enable or disable a root. Disabled roots stay in the store but are
    /// neither watched nor searched.
    ///
    /// # Errors
    ///
    /// `NotFound` if the root is not registered, or a storage error.
    pub async fn set_root_enabled(&self, path: &Path, enabled: bool) -> Result<()> {
        let root = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let key = path_key(&root);
        let (kind, verb) = if enabled {
            ("root_enabled", "Enabled")
        } else {
            ("root_disabled", "Disabled")
        };
        let message = format!("{verb} document folder: {}", display_name(&root));

        {
            let _gate = self.inner.gate.write().await;
            let (root, key) = (root.clone(), key.clone());
            self.inner
                .blocking(move |inner| {
                    inner.db.with_transaction(|conn| {
                        set_root_enabled(conn, &key, enabled)?;
                        log_activity(conn, kind, &message, Some(&key))
                    })?;
                    inner.reload_roots()?;
                    if enabled {
                        inner.client.add_root(&root)?;
                    } else {
                        inner.client.remove_root(&root)?;
                    }
                    Ok(())
                })
                .await?;
        }

        tracing::info!(root = %key, enabled, "Root toggled");
        if enabled {
            self.spawn_root_scan(root);
        }
        Ok(())
    }

    /// Every registered root.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn list_roots(&self) -> Result<Vec<RootRecord>> {
        self.inner.db.with_conn(|conn| list_roots(conn, false))
    }

    /// Index one file now.
    ///
    /// # Errors
    ///
    /// Returns the parse, embedding or storage error; the file is also
    /// scheduled for retry.
    pub async fn index_file(&self, path: &Path) -> Result<IndexOutcome> {
        self.inner.index_file(path).await
    }

    /// Remove one file's document. Returns the number of chunks removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn remove_file(&self, path: &Path) -> Result<usize> {
        self.inner.remove_file(path).await
    }

    /// Consume and apply one batch of queued events. Returns `(applied, requeued)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or acknowledged.
    pub async fn process_pending(&self) -> Result<(usize, usize)> {
        self.inner.process_batch().await
    }

    /// Retry failed files whose retry time has passed. Returns how many succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule cannot be read.
    pub async fn retry_failed(&self) -> Result<usize> {
        self.inner.retry_failed().await
    }

    /// Diff every enabled root against the store and repair it.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn resync(&self) -> Result<ResyncReport> {
        let cancel = self.cancel.lock().clone();
        self.inner.resync(&cancel).await
    }

    /// Report discrepancies between the filesystem and the store.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn integrity_check(&self) -> Result<IntegrityReport> {
        let inner = &self.inner;
        let roots = inner.db.with_conn(|conn| list_roots(conn, true))?;
        let mut report = IntegrityReport::default();

        let mut on_disk = HashSet::new();
        for root in &roots {
            let files = inner.list_files(&root.path_buf()).await?;
            report.roots.push(root.path.clone());
            report.files_by_root.insert(root.path.clone(), files.len());
            on_disk.extend(files.iter().map(|p| path_key(p)));
        }

        let documents = inner.db.with_conn(|conn| list_documents(conn, None, usize::MAX, 0))?;
        let mut indexed = HashSet::with_capacity(documents.len());
        for doc in &documents {
            indexed.insert(doc.path.clone());
            let path = Path::new(&doc.path);
            if !path.is_file() || !inner.roots.is_under_any_root(path) {
                report.orphaned_in_index.push(doc.path.clone());
                continue;
            }
            if on_disk.contains(&doc.path) {
                if let Ok(bytes) = tokio::fs::read(path).await {
                    if blake3::hash(&bytes).to_hex().as_str() != doc.content_hash {
                        report.modified.push(doc.path.clone());
                    }
                }
            }
            let stored = inner.db.with_conn(|conn| count_chunks_for_document(conn, &doc.path))?;
            if stored != doc.chunk_count {
                report.chunk_count_mismatches.push(doc.path.clone());
            }
        }

        report.missing_from_index = on_disk.into_iter().filter(|p| !indexed.contains(p)).collect();
        report.missing_from_index.sort();
        report.total_issues = report.missing_from_index.len()
            + report.orphaned_in_index.len()
            + report.modified.len()
            + report.chunk_count_mismatches.len();
        report.stats = inner.store.stats()?;

        let message = format!("Integrity check: {} issues found", report.total_issues);
        inner.db.with_conn(|conn| log_activity(conn, "integrity_check", &message, None))?;
        tracing::info!(issues = report.total_issues, "Integrity check complete");
        Ok(report)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        if query.trim().is_empty() {
            return Err(Error::invalid("query cannot be empty"));
        }
        self.inner.embedder.embed_single(query).await
    }

    /// Semantic chunk search. Disabled roots are always excluded.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty query, or the embedding/storage error.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        let vector = self.embed_query(query).await?;
        self.inner
            .store
            .search(&vector, &self.inner.with_disabled_roots(options))
    }

    /// Semantic search ranked per document.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty query, or the embedding/storage error.
    pub async fn search_documents(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<DocumentSearchResult>> {
        let vector = self.embed_query(query).await?;
        self.inner
            .store
            .search_documents(&vector, &self.inner.with_disabled_roots(options))
    }

    /// Full-text chunk search.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty query, or a storage error.
    pub fn keyword_search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(Error::invalid("query cannot be empty"));
        }
        self.inner
            .store
            .keyword_search(query, &self.inner.with_disabled_roots(options))
    }

    /// Best-matching chunks joined into one prompt-ready string.
    ///
    /// Each part is `[Source: <file name>]` followed by the chunk text. Parts
    /// are added until `max_chars` would be exceeded; the overflowing part is
    /// cut and added only if more than 100 characters remain.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty query, or the embedding/storage error.
    pub async fn get_context_for_query(&self, query: &str, max_chunks: usize, max_chars: usize) -> Result<String> {
        let results = self.search(query, SearchOptions::new(max_chunks)).await?;
        Ok(assemble_context(&results, max_chars))
    }

    /// Stored documents, optionally under one directory.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn list_documents(&self, under: Option<&str>, limit: usize, offset: usize) -> Result<Vec<DocumentRecord>> {
        self.inner.store.list_documents(under, limit, offset)
    }

    /// Chunks of one document, in order.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn chunks_for(&self, path: &str) -> Result<Vec<ChunkRecord>> {
        self.inner.store.get_chunks_for_document(path)
    }

    /// Most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.inner.db.with_conn(|conn| recent_activity(conn, limit))
    }

    /// Files waiting for a retry.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn failures(&self) -> Result<Vec<FailedFile>> {
        self.inner.db.with_conn(list_failures)
    }

    /// Store counts, lifecycle state and queue depths.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn stats(&self) -> Result<IndexerStats> {
        let inner = &self.inner;
        inner.refresh_gauges();
        Ok(IndexerStats {
            store: inner.store.stats()?,
            state: self.state(),
            watcher_running: inner.client.watcher_running()?,
            pending_events: inner.client.pending_events()?,
            pending_commands: inner.client.pending_commands()?,
            model_id: inner.store.model_id().to_string(),
            dimensions: inner.store.dimensions(),
        })
    }
}

fn assemble_context(results: &[SearchResult], max_chars: usize) -> String {
    let mut parts = Vec::with_capacity(results.len());
    let mut total = 0;
    for result in results {
        let source = display_name(Path::new(&result.chunk.document_path));
        let part = format!("[Source: {source}]\n{}\n", result.chunk.content);
        let len = part.chars().count();
        if total + len > max_chars {
            let remaining = max_chars.saturating_sub(total);
            if remaining > CONTEXT_MIN_TAIL {
                let mut cut: String = part.chars().take(remaining).collect();
                cut.push_str("...");
                parts.push(cut);
            }
            break;
        }
        total += len;
        parts.push(part);
    }
    parts.join(CONTEXT_SEPARATOR)
}

impl std::fmt::Debug for IndexerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerProcess")
            .field("state", &self.state())
            .field("roots", &self.inner.roots.len())
            .field("model", &self.inner.store.model_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingProvider;
    use crate::embeddings::HashEmbedder;
    use crate::storage::init_storage;
    use tempfile::TempDir;

    const DIMS: usize = 64;

    fn setup() -> (TempDir, IndexerProcess) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let mut config = Config::default();
        config.embedding.provider = EmbeddingProvider::Hash;
        config.indexer.retry_failed_after_seconds = 0;
        let indexer = IndexerProcess::new(db, &config, Arc::new(HashEmbedder::new(DIMS))).unwrap();
        (dir, indexer)
    }

    fn root_of(dir: &TempDir) -> PathBuf {
        dir.path().canonicalize().unwrap()
    }

    fn event_queue(indexer: &IndexerProcess) -> crate::queue::PersistentQueue<FileEvent> {
        crate::queue::PersistentQueue::open(indexer.database().clone(), crate::queue::EVENT_QUEUE_TABLE).unwrap()
    }

    #[tokio::test]
    async fn test_add_root_scans_existing_files() {
        let (dir, indexer) = setup();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("photo.jpg"), [0xFF, 0xD8]).unwrap();

        assert!(indexer.add_root(dir.path()).await.unwrap());
        indexer.wait_for_scans().await;

        let stats = indexer.stats().unwrap();
        assert_eq!(stats.store.documents, 1);
        assert_eq!(stats.store.chunks, 1);
        assert_eq!(stats.store.embeddings, 1);
        assert_eq!(indexer.watcher().pending_commands().unwrap(), 1);
        assert_eq!(indexer.activity(10).unwrap()[0].kind, "root_added");

        assert!(!indexer.add_root(dir.path()).await.unwrap());
        assert_eq!(indexer.list_roots().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nested_roots_conflict() {
        let (dir, indexer) = setup();
        let child = dir.path().join("child");
        std::fs::create_dir(&child).unwrap();

        indexer.add_root(&child).await.unwrap();
        let err = indexer.add_root(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert!(err.to_string().contains("contains the already-managed folder"));

        let missing = indexer.add_root(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unchanged_content_is_skipped() {
        let (dir, indexer) = setup();
        let file = root_of(&dir).join("a.txt");
        std::fs::write(&file, "hello").unwrap();
        indexer.add_root(dir.path()).await.unwrap();
        indexer.wait_for_scans().await;

        let before = indexer.chunks_for(&path_key(&file)).unwrap();
        assert_eq!(indexer.index_file(&file).await.unwrap(), IndexOutcome::Unchanged);
        let after = indexer.chunks_for(&path_key(&file)).unwrap();
        assert_eq!(before[0].chunk_id, after[0].chunk_id);

        std::fs::write(&file, "hello world").unwrap();
        assert_eq!(indexer.index_file(&file).await.unwrap(), IndexOutcome::Indexed { chunks: 1 });
        let updated = indexer.chunks_for(&path_key(&file)).unwrap();
        assert_eq!(updated[0].content, "hello world");
        assert_ne!(updated[0].chunk_id, before[0].chunk_id);
    }

    #[tokio::test]
    async fn test_queued_events_apply_in_order() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        let a = root.join("a.txt");
        let b = root.join("b.txt");
        std::fs::write(&b, "moved text").unwrap();
        std::fs::write(&a, "first").unwrap();

        let queue = event_queue(&indexer);
        queue.enqueue(&FileEvent::add(&a, &root)).unwrap();
        queue.enqueue(&FileEvent::moved(&a, &root, &b, &root)).unwrap();
        queue.enqueue(&FileEvent::delete(&b, &root)).unwrap();

        let (applied, requeued) = indexer.process_pending().await.unwrap();
        assert_eq!((applied, requeued), (3, 0));
        assert_eq!(indexer.stats().unwrap().store.documents, 0);
        assert_eq!(indexer.watcher().pending_events().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_keeps_chunks() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        let old = root.join("doc.txt");
        std::fs::write(&old, "some text about apples").unwrap();
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;
        let before = indexer.chunks_for(&path_key(&old)).unwrap();

        let new = root.join("doc2.txt");
        std::fs::rename(&old, &new).unwrap();
        event_queue(&indexer)
            .enqueue(&FileEvent::moved(&old, &root, &new, &root))
            .unwrap();
        indexer.process_pending().await.unwrap();

        let after = indexer.chunks_for(&path_key(&new)).unwrap();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].chunk_id, before[0].chunk_id);
        assert!(indexer.chunks_for(&path_key(&old)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_is_scheduled_for_retry() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        let broken = root.join("broken.pdf");
        std::fs::write(&broken, "not a pdf").unwrap();
        event_queue(&indexer).enqueue(&FileEvent::add(&broken, &root)).unwrap();
        let (applied, requeued) = indexer.process_pending().await.unwrap();
        assert_eq!((applied, requeued), (1, 0));

        let failures = indexer.failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, path_key(&broken));

        std::fs::remove_file(&broken).unwrap();
        assert_eq!(indexer.retry_failed().await.unwrap(), 1);
        assert!(indexer.failures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_root_removes_documents_first() {
        let (dir, indexer) = setup();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.md"), "# Beta\n\nbeta body").unwrap();
        indexer.add_root(dir.path()).await.unwrap();
        indexer.wait_for_scans().await;
        assert_eq!(indexer.stats().unwrap().store.documents, 2);

        assert_eq!(indexer.remove_root(dir.path()).await.unwrap(), 2);
        let stats = indexer.stats().unwrap();
        assert_eq!((stats.store.documents, stats.store.chunks, stats.store.embeddings), (0, 0, 0));
        assert!(indexer.list_roots().unwrap().is_empty());
        assert_eq!(indexer.watcher().pending_commands().unwrap(), 2);

        let err = indexer.remove_root(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resync_picks_up_offline_changes() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        std::fs::write(root.join("keep.txt"), "keep").unwrap();
        std::fs::write(root.join("edit.txt"), "before").unwrap();
        std::fs::write(root.join("gone.txt"), "gone").unwrap();
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        std::fs::write(root.join("edit.txt"), "after").unwrap();
        std::fs::remove_file(root.join("gone.txt")).unwrap();
        std::fs::write(root.join("new.txt"), "new").unwrap();

        let report = indexer.resync().await.unwrap();
        assert_eq!((report.added, report.updated, report.removed, report.unchanged), (1, 1, 1, 1));
        assert_eq!(indexer.stats().unwrap().store.documents, 3);
        assert_eq!(indexer.activity(1).unwrap()[0].kind, "resync");
    }

    #[tokio::test]
    async fn test_integrity_check_reports_without_repairing() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        std::fs::write(root.join("a.txt"), "alpha").unwrap();
        std::fs::write(root.join("b.txt"), "beta").unwrap();
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        std::fs::remove_file(root.join("a.txt")).unwrap();
        std::fs::write(root.join("b.txt"), "beta changed").unwrap();
        std::fs::write(root.join("c.txt"), "gamma").unwrap();

        let report = indexer.integrity_check().await.unwrap();
        assert_eq!(report.orphaned_in_index, vec![path_key(&root.join("a.txt"))]);
        assert_eq!(report.modified, vec![path_key(&root.join("b.txt"))]);
        assert_eq!(report.missing_from_index, vec![path_key(&root.join("c.txt"))]);
        assert_eq!(report.total_issues, 3);
        assert_eq!(report.files_by_root[&path_key(&root)], 2);
        assert_eq!(indexer.stats().unwrap().store.documents, 2);
    }

    #[tokio::test]
    async fn test_disabled_roots_are_not_searched() {
        let (dir, indexer) = setup();
        std::fs::write(dir.path().join("fruit.txt"), "apples and pears").unwrap();
        indexer.add_root(dir.path()).await.unwrap();
        indexer.wait_for_scans().await;
        assert_eq!(indexer.search("apples", SearchOptions::new(5)).await.unwrap().len(), 1);

        indexer.set_root_enabled(dir.path(), false).await.unwrap();
        assert!(indexer.search("apples", SearchOptions::new(5)).await.unwrap().is_empty());
        assert_eq!(indexer.stats().unwrap().store.documents, 1);
        assert_eq!(indexer.activity(1).unwrap()[0].kind, "root_disabled");

        let err = indexer.search("  ", SearchOptions::new(5)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    /// Delegates to a hash embedder until told to fail.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyEmbedder {
        fn new() -> Self {
            Self {
                inner: HashEmbedder::new(DIMS),
                failing: std::sync::atomic::AtomicBool::new(true),
            }
        }

        fn recover(&self) {
            self.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn batch_size(&self) -> usize {
            self.inner.batch_size()
        }

        fn max_tokens(&self) -> usize {
            self.inner.max_tokens()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::error::EmbeddingError::RetriesExhausted {
                    attempts: 3,
                    last: "connection reset".to_string(),
                }
                .into());
            }
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn test_exhausted_embedding_retries_requeue_events() {
        let dir = TempDir::new().unwrap();
        let root = root_of(&dir);
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let mut config = Config::default();
        config.embedding.provider = EmbeddingProvider::Hash;
        let embedder = Arc::new(FlakyEmbedder::new());
        let indexer = IndexerProcess::new(db, &config, Arc::clone(&embedder) as Arc<dyn Embedder>).unwrap();
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        let file = root.join("notes.txt");
        std::fs::write(&file, "meeting notes").unwrap();
        let queue = event_queue(&indexer);
        queue.enqueue(&FileEvent::add(&file, &root)).unwrap();
        queue.enqueue(&FileEvent::update(&file, &root)).unwrap();
        queue.enqueue(&FileEvent::delete(root.join("never-indexed.txt"), &root)).unwrap();

        assert_eq!(indexer.process_pending().await.unwrap(), (1, 2));
        assert_eq!(indexer.watcher().pending_events().unwrap(), 2);
        assert_eq!(indexer.stats().unwrap().store.documents, 0);

        embedder.recover();
        assert_eq!(indexer.process_pending().await.unwrap(), (2, 0));
        assert_eq!(indexer.watcher().pending_events().unwrap(), 0);
        assert_eq!(indexer.stats().unwrap().store.documents, 1);
    }

    #[tokio::test]
    async fn test_model_change_replaces_all_embeddings() {
        let (dir, first) = setup();
        let root = root_of(&dir);
        let file = root.join("report.md");
        std::fs::write(&file, "# Report\n\nQuarterly revenue grew.\n\n# Outlook\n\nSteady.").unwrap();
        first.add_root(&root).await.unwrap();
        first.wait_for_scans().await;
        let key = path_key(&file);
        let chunks = first.chunks_for(&key).unwrap().len();
        assert!(chunks > 0);

        let mut config = Config::default();
        config.embedding.provider = EmbeddingProvider::Hash;
        let db = first.database().clone();
        let second = IndexerProcess::new(db.clone(), &config, Arc::new(HashEmbedder::new(32))).unwrap();
        assert_eq!(second.index_file(&file).await.unwrap(), IndexOutcome::Indexed { chunks });
        assert_eq!(second.index_file(&file).await.unwrap(), IndexOutcome::Unchanged);

        let document = second.store().get_document(&key).unwrap().unwrap();
        assert_eq!(document.model_id, "hash-32");
        let models: Vec<(String, i64)> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT model_id, dimensions FROM embeddings")
                    .unwrap();
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .unwrap()
                    .map(std::result::Result::unwrap)
                    .collect();
                Ok(rows)
            })
            .unwrap();
        assert_eq!(models.len(), chunks);
        assert!(models.iter().all(|(model, dims)| model == "hash-32" && *dims == 32));
    }

    #[tokio::test]
    async fn test_acknowledged_events_are_purged() {
        let (dir, indexer) = setup();
        let root = root_of(&dir);
        indexer.add_root(&root).await.unwrap();
        indexer.wait_for_scans().await;

        let queue = event_queue(&indexer);
        queue.enqueue(&FileEvent::delete(root.join("a.txt"), &root)).unwrap();
        queue.enqueue(&FileEvent::delete(root.join("b.txt"), &root)).unwrap();
        assert_eq!(indexer.process_pending().await.unwrap(), (2, 0));
        assert_eq!(queue.total_size().unwrap(), 2);

        assert_eq!(indexer.inner.purge_queues(), 2);
        assert_eq!(queue.total_size().unwrap(), 0);
        assert_eq!(indexer.watcher().pending_commands().unwrap(), 1);
    }

    fn result(path: &str, content: &str) -> SearchResult {
        SearchResult {
            chunk: ChunkRecord {
                chunk_id: "c".to_string(),
                document_path: path.to_string(),
                content: content.to_string(),
                start_offset: 0,
                end_offset: content.chars().count(),
                chunk_index: 0,
                metadata: serde_json::json!({}),
            },
            score: 1.0,
        }
    }

    #[test]
    fn test_context_assembly() {
        let results = vec![result("/r/a.txt", "alpha"), result("/r/sub/b.txt", "beta")];
        assert_eq!(
            assemble_context(&results, 8000),
            "[Source: a.txt]\nalpha\n\n---\n[Source: b.txt]\nbeta\n"
        );
        assert_eq!(assemble_context(&[], 8000), "");
    }

    #[test]
    fn test_context_truncates_last_part() {
        let long = "x".repeat(500);
        let results = vec![result("/r/a.txt", "alpha"), result("/r/b.txt", &long)];
        let first_len = "[Source: a.txt]\nalpha\n".chars().count();

        let context = assemble_context(&results, first_len + 150);
        assert!(context.ends_with("..."));
        assert!(context.starts_with("[Source: a.txt]"));

        let tight = assemble_context(&results, first_len + 50);
        assert_eq!(tight, "[Source: a.txt]\nalpha\n");
    }

    #[test]
    fn test_grouping_keeps_shared_paths_together() {
        let item = |id, event| QueueItem { id, payload: event };
        let groups = group_by_path(vec![
            item(1, FileEvent::add("/r/a", "/r")),
            item(2, FileEvent::add("/r/b", "/r")),
            item(3, FileEvent::moved("/r/a", "/r", "/r/b", "/r")),
            item(4, FileEvent::update("/r/c", "/r")),
            item(5, FileEvent::delete("/r/b", "/r")),
        ]);
        let ids: Vec<Vec<i64>> = groups.iter().map(|g| g.iter().map(|i| i.id).collect()).collect();
        assert_eq!(ids, vec![vec![1, 2, 3, 5], vec![4]]);
    }
}
