//! Turns raw notifications into semantic [`FileEvent`]s.
//!
//! Deletes go through the [`MoveCorrelator`] first, then every semantic event
//! is merged by the [`Debouncer`]. The processor also keeps the set of known
//! files per root, which is what lets a directory delete expand into one
//! DELETE per file the directory used to contain.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use walkdir::WalkDir;

use super::clock::Clock;
use super::correlator::MoveCorrelator;
use super::debouncer::Debouncer;
use super::events::{FileEvent, FileEventKind, RawKind, RawNotification};
use super::filter::FileFilter;
use super::root_manager::RootManager;

/// Window lengths for the processor.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorTiming {
    /// Quiet period before an event is emitted.
    pub debounce: Duration,
    /// Maximum delete-to-create gap for a move.
    pub move_correlation: Duration,
}

impl Default for ProcessorTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            move_correlation: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct State {
    correlator: MoveCorrelator,
    debouncer: Debouncer,
    known: BTreeSet<PathBuf>,
    filters: HashMap<PathBuf, FileFilter>,
}

impl State {
    fn known_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.known
            .range(dir.to_path_buf()..)
            .take_while(|p| p.starts_with(dir))
            .filter(|p| p.as_path() != dir)
            .cloned()
            .collect()
    }
}

/// Correlating, debouncing event processor.
pub struct EventProcessor {
    roots: Arc<RootManager>,
    clock: Arc<dyn Clock>,
    ignore_patterns: Vec<String>,
    state: Mutex<State>,
}

impl EventProcessor {
    /// Create a processor resolving roots through `roots`.
    #[must_use]
    pub fn new(
        roots: Arc<RootManager>,
        clock: Arc<dyn Clock>,
        timing: ProcessorTiming,
        ignore_patterns: Vec<String>,
    ) -> Self {
        Self {
            roots,
            clock,
            ignore_patterns,
            state: Mutex::new(State {
                correlator: MoveCorrelator::new(timing.move_correlation),
                debouncer: Debouncer::new(timing.debounce),
                known: BTreeSet::new(),
                filters: HashMap::new(),
            }),
        }
    }

    fn filter_for(&self, root: &Path) -> Option<FileFilter> {
        match FileFilter::new(root, &self.ignore_patterns) {
            Ok(filter) => Some(filter),
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Ignoring invalid patterns");
                None
            }
        }
    }

    fn list_files(filter: Option<&FileFilter>, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| filter.map_or(true, |f| f.accepts(e.path(), e.file_type().is_dir())))
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect()
    }

    /// Record the current files under `root` so later deletes can expand.
    ///
    /// Walks the filesystem outside the state lock. Returns the number of files found.
    pub fn seed_root(&self, root: &Path) -> usize {
        let filter = self.filter_for(root);
        let files = Self::list_files(filter.as_ref(), root);
        let count = files.len();

        let mut state = self.state.lock();
        if let Some(filter) = filter {
            state.filters.insert(root.to_path_buf(), filter);
        }
        state.known.extend(files);
        count
    }

    /// Forget everything about `root` without emitting events.
    pub fn forget_root(&self, root: &Path) {
        let mut state = self.state.lock();
        let under = state.known_under(root);
        for path in under {
            state.known.remove(&path);
        }
        state.filters.remove(root);
        state.correlator.forget_under(root);
        state.debouncer.forget_under(root);
    }

    /// Emit a DELETE for every file under a root that vanished, and forget it.
    ///
    /// Covers known files as well as deletes and updates still waiting in the
    /// correlator or debouncer, so notifications racing the disappearance are
    /// not lost.
    pub fn drop_root(&self, root: &Path) -> Vec<FileEvent> {
        let mut state = self.state.lock();
        let mut gone: BTreeSet<PathBuf> = state.known_under(root).into_iter().collect();
        gone.extend(state.correlator.take_under(root));

        let mut events = Vec::new();
        for pending in state.debouncer.take_under(root) {
            match pending.kind {
                FileEventKind::Add => {}
                FileEventKind::Update | FileEventKind::Delete => {
                    gone.insert(pending.path);
                }
                FileEventKind::Move => {
                    if let (Some(old_path), Some(old_root)) = (pending.old_path, pending.old_root) {
                        if old_root == root {
                            gone.insert(old_path);
                        } else {
                            events.push(FileEvent::delete(old_path, old_root));
                        }
                    }
                }
            }
        }

        for path in &gone {
            state.known.remove(path);
        }
        state.filters.remove(root);
        events.extend(gone.into_iter().map(|path| FileEvent::delete(path, root)));
        events
    }

    /// Number of files currently known under `root`.
    #[must_use]
    pub fn known_files(&self, root: &Path) -> usize {
        self.state.lock().known_under(root).len()
    }

    /// Deferred deletes plus debounced events not yet emitted.
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.correlator.len() + state.debouncer.len()
    }

    fn accepted(state: &State, root: &Path, path: &Path, is_dir: bool) -> bool {
        state
            .filters
            .get(root)
            .map_or(true, |f| f.accepts(path, is_dir))
    }

    fn resolve(&self, state: &State, path: &Path, is_dir: bool) -> Option<PathBuf> {
        let root = self.roots.find_root_for_path(path)?;
        Self::accepted(state, &root, path, is_dir).then_some(root)
    }

    /// Feed one raw notification.
    pub fn process(&self, raw: RawNotification) {
        // Directory contents are listed before the lock is taken.
        let listing = match raw.kind {
            RawKind::Created if raw.is_directory => {
                let filter = self
                    .roots
                    .find_root_for_path(&raw.src_path)
                    .and_then(|root| self.state.lock().filters.get(&root).cloned());
                Self::list_files(filter.as_ref(), &raw.src_path)
            }
            RawKind::Moved if raw.is_directory => raw
                .dest_path
                .as_deref()
                .map(|dest| Self::list_files(None, dest))
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut state = self.state.lock();
        match raw.kind {
            RawKind::Created if raw.is_directory => {
                for file in listing {
                    self.on_create(&mut state, file, raw.at);
                }
            }
            RawKind::Created => self.on_create(&mut state, raw.src_path, raw.at),
            RawKind::Modified => self.on_modify(&mut state, raw.src_path, raw.at),
            RawKind::Deleted => Self::on_delete(&mut state, &raw.src_path, raw.at),
            RawKind::Moved => {
                let Some(dest) = raw.dest_path else {
                    return;
                };
                // A `From` half may already have deferred deletes for the source.
                for path in state.correlator.take_under(&raw.src_path) {
                    state.known.insert(path);
                }
                if raw.is_directory {
                    self.on_directory_move(&mut state, &raw.src_path, &dest, &listing, raw.at);
                } else {
                    self.on_move(&mut state, raw.src_path, dest, raw.at);
                }
            }
        }
    }

    fn on_create(&self, state: &mut State, path: PathBuf, at: Instant) {
        if let Some(old) = state.correlator.take_match(&path, at) {
            if old == path {
                if let Some(root) = self.resolve(state, &path, false) {
                    state.known.insert(path.clone());
                    state.debouncer.push(FileEvent::update(path, root), at);
                }
            } else {
                self.on_move(state, old, path, at);
            }
            return;
        }

        let Some(root) = self.resolve(state, &path, false) else {
            return;
        };
        let event = if state.known.insert(path.clone()) {
            FileEvent::add(path, root)
        } else {
            FileEvent::update(path, root)
        };
        state.debouncer.push(event, at);
    }

    fn on_modify(&self, state: &mut State, path: PathBuf, at: Instant) {
        let Some(root) = self.resolve(state, &path, false) else {
            return;
        };
        state.known.insert(path.clone());
        state.debouncer.push(FileEvent::update(path, root), at);
    }

    fn on_delete(state: &mut State, path: &Path, at: Instant) {
        if state.known.remove(path) {
            state.correlator.record_delete(path.to_path_buf(), at);
            return;
        }
        let under = state.known_under(path);
        if under.is_empty() {
            // Unknown file; the indexer treats a DELETE of an unindexed path as a no-op.
            state.correlator.record_delete(path.to_path_buf(), at);
            return;
        }
        for file in under {
            state.known.remove(&file);
            state.correlator.record_delete(file, at);
        }
    }

    fn on_move(&self, state: &mut State, from: PathBuf, to: PathBuf, at: Instant) {
        let old_root = self.resolve(state, &from, false);
        let new_root = self.resolve(state, &to, false);
        state.known.remove(&from);

        match (old_root, new_root) {
            (Some(old_root), Some(root)) => {
                state.known.insert(to.clone());
                state.debouncer.push(FileEvent::moved(from, old_root, to, root), at);
            }
            (Some(old_root), None) => state.debouncer.push(FileEvent::delete(from, old_root), at),
            (None, Some(root)) => {
                let event = if state.known.insert(to.clone()) {
                    FileEvent::add(to, root)
                } else {
                    FileEvent::update(to, root)
                };
                state.debouncer.push(event, at);
            }
            (None, None) => {}
        }
    }

    fn on_directory_move(
        &self,
        state: &mut State,
        from: &Path,
        to: &Path,
        listing: &[PathBuf],
        at: Instant,
    ) {
        let mut moved = BTreeSet::new();
        for old in state.known_under(from) {
            let Ok(rel) = old.strip_prefix(from) else {
                continue;
            };
            let new = to.join(rel);
            moved.insert(new.clone());
            self.on_move(state, old, new, at);
        }
        for file in listing {
            if !moved.contains(file) {
                self.on_create(state, file.clone(), at);
            }
        }
    }

    /// Emit events whose windows have elapsed.
    pub fn flush(&self) -> Vec<FileEvent> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (path, at) in state.correlator.expire(now) {
            if let Some(root) = self.roots.find_root_for_path(&path) {
                state.debouncer.push(FileEvent::delete(path, root), at);
            }
        }
        // A path whose delete is still deferred must not emit ahead of it.
        let correlator = &state.correlator;
        state.debouncer.flush_except(now, |path| correlator.holds(path))
    }

    /// Emit everything pending regardless of windows.
    pub fn flush_all(&self) -> Vec<FileEvent> {
        let mut state = self.state.lock();
        for (path, at) in state.correlator.drain() {
            if let Some(root) = self.roots.find_root_for_path(&path) {
                state.debouncer.push(FileEvent::delete(path, root), at);
            }
        }
        state.debouncer.flush_all()
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::watcher::clock::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        roots: Arc<RootManager>,
        processor: EventProcessor,
    }

    fn fixture(roots: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(RootManager::new());
        for r in roots {
            manager.add_root(*r);
        }
        let processor = EventProcessor::new(
            Arc::clone(&manager),
            Arc::clone(&clock) as Arc<dyn Clock>,
            ProcessorTiming::default(),
            vec!["*.tmp".to_string()],
        );
        Fixture {
            clock,
            roots: manager,
            processor,
        }
    }

    impl Fixture {
        fn raw(&self, kind: RawKind, path: &str) {
            self.processor
                .process(RawNotification::new(kind, path, false, self.clock.now()));
        }

        fn settle(&self) -> Vec<FileEvent> {
            self.clock.advance_ms(200);
            self.processor.flush()
        }
    }

    #[test]
    fn test_create_then_delete_yields_nothing() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.clock.advance_ms(10);
        f.raw(RawKind::Deleted, "/docs/a.txt");
        assert!(f.settle().is_empty());
    }

    #[test]
    fn test_create_then_delete_yields_nothing_with_frequent_flushes() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.clock.advance_ms(10);
        f.raw(RawKind::Deleted, "/docs/a.txt");

        let mut out = Vec::new();
        for _ in 0..20 {
            f.clock.advance_ms(20);
            out.extend(f.processor.flush());
        }
        assert!(out.is_empty(), "unexpected events: {out:?}");
        assert_eq!(f.processor.pending(), 0);
    }

    #[test]
    fn test_create_then_rename_with_frequent_flushes_is_add_at_new_path() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a/doc.pdf");
        f.clock.advance_ms(10);
        f.raw(RawKind::Deleted, "/docs/a/doc.pdf");

        let mut out = Vec::new();
        for step in 0..20 {
            if step == 2 {
                f.raw(RawKind::Created, "/docs/b/doc.pdf");
            }
            f.clock.advance_ms(20);
            out.extend(f.processor.flush());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Add);
        assert_eq!(out[0].path, PathBuf::from("/docs/b/doc.pdf"));
    }

    #[test]
    fn test_rename_within_window_is_one_move() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a/doc.pdf");
        f.settle();

        f.raw(RawKind::Deleted, "/docs/a/doc.pdf");
        f.clock.advance_ms(30);
        f.raw(RawKind::Created, "/docs/b/doc.pdf");

        let out = f.settle();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Move);
        assert_eq!(out[0].old_path.as_deref(), Some(Path::new("/docs/a/doc.pdf")));
        assert_eq!(out[0].path, PathBuf::from("/docs/b/doc.pdf"));
    }

    #[test]
    fn test_move_out_of_roots_is_delete() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.settle();

        f.processor.process(RawNotification::moved(
            "/docs/a.txt",
            "/tmp/elsewhere/a.txt",
            false,
            f.clock.now(),
        ));
        let out = f.settle();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Delete);
        assert_eq!(out[0].path, PathBuf::from("/docs/a.txt"));
    }

    #[test]
    fn test_unpaired_delete_flushes_after_window() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.settle();

        f.raw(RawKind::Deleted, "/docs/a.txt");
        f.clock.advance_ms(50);
        assert!(f.processor.flush().is_empty());
        let out = f.settle();
        assert_eq!(out[0].kind, FileEventKind::Delete);
    }

    #[test]
    fn test_cross_root_move_carries_both_roots() {
        let f = fixture(&["/r1", "/r2"]);
        f.raw(RawKind::Created, "/r1/x.md");
        f.settle();

        f.raw(RawKind::Deleted, "/r1/x.md");
        f.raw(RawKind::Created, "/r2/x.md");
        let out = f.settle();
        assert_eq!(out[0].kind, FileEventKind::Move);
        assert_eq!(out[0].old_root.as_deref(), Some(Path::new("/r1")));
        assert_eq!(out[0].root, PathBuf::from("/r2"));
    }

    #[test]
    fn test_directory_delete_expands_to_known_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/one.txt"), "1").unwrap();
        std::fs::write(root.join("sub/two.txt"), "2").unwrap();
        std::fs::write(root.join("keep.txt"), "k").unwrap();
        std::fs::write(root.join("skip.tmp"), "t").unwrap();

        let f = fixture(&[]);
        f.roots.add_root(&root);
        assert_eq!(f.processor.seed_root(&root), 3);

        f.processor.process(RawNotification::new(
            RawKind::Deleted,
            root.join("sub"),
            true,
            f.clock.now(),
        ));
        let mut paths: Vec<_> = f.settle().into_iter().map(|e| (e.kind, e.path)).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                (FileEventKind::Delete, root.join("sub/one.txt")),
                (FileEventKind::Delete, root.join("sub/two.txt")),
            ]
        );
        assert_eq!(f.processor.known_files(&root), 1);
    }

    #[test]
    fn test_drop_root_deletes_everything_known() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.raw(RawKind::Created, "/docs/b.txt");
        f.settle();

        let events = f.processor.drop_root(Path::new("/docs"));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == FileEventKind::Delete));
        assert_eq!(f.processor.known_files(Path::new("/docs")), 0);
    }

    #[test]
    fn test_drop_root_includes_deferred_deletes() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.settle();
        f.raw(RawKind::Deleted, "/docs/a.txt");

        let events = f.processor.drop_root(Path::new("/docs"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, PathBuf::from("/docs/a.txt"));
        assert_eq!(f.processor.pending(), 0);
    }

    #[test]
    fn test_editor_save_storm_is_one_update() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a.txt");
        f.settle();

        for _ in 0..10 {
            f.raw(RawKind::Modified, "/docs/a.txt");
            f.clock.advance_ms(5);
        }
        let out = f.settle();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Update);
    }

    #[test]
    fn test_paths_outside_roots_dropped() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/other/a.txt");
        f.raw(RawKind::Modified, "/other/a.txt");
        assert!(f.settle().is_empty());
    }

    #[test]
    fn test_split_rename_then_combined_move_is_one_move() {
        let f = fixture(&["/docs"]);
        f.raw(RawKind::Created, "/docs/a/doc.pdf");
        f.settle();

        f.raw(RawKind::Deleted, "/docs/a/doc.pdf");
        f.processor.process(RawNotification::moved(
            "/docs/a/doc.pdf",
            "/docs/a/doc2.pdf",
            false,
            f.clock.now(),
        ));

        let out = f.settle();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Move);
        assert_eq!(out[0].old_path.as_deref(), Some(Path::new("/docs/a/doc.pdf")));
        assert_eq!(out[0].path, PathBuf::from("/docs/a/doc2.pdf"));
    }
}
