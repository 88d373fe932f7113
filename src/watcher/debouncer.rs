//! Per-path coalescing of semantic events.
//!
//! Merge rules, applied in arrival order:
//!
//! | pending | incoming | result |
//! |---|---|---|
//! | ADD | UPDATE | ADD |
//! | UPDATE / MOVE | UPDATE | unchanged |
//! | ADD | DELETE | nothing |
//! | MOVE | DELETE | DELETE of the move's old path |
//! | other | DELETE | DELETE |
//! | DELETE | ADD | UPDATE |
//! | other | ADD | ADD |
//!
//! An incoming MOVE absorbs whatever is pending at its old path: a pending ADD
//! turns it into an ADD at the new path, a pending MOVE is chained.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::events::{FileEvent, FileEventKind};

#[derive(Debug, Clone)]
struct Pending {
    event: FileEvent,
    seq: u64,
    last_at: Instant,
}

/// Coalesces bursts of events per path within a quiet window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
    seq: u64,
}

impl Debouncer {
    /// New debouncer with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn put(&mut self, event: FileEvent, seq: u64, at: Instant) {
        self.pending.insert(
            event.path.clone(),
            Pending {
                event,
                seq,
                last_at: at,
            },
        );
    }

    /// Merge `event` observed at `at` into the pending set.
    pub fn push(&mut self, event: FileEvent, at: Instant) {
        match event.kind {
            FileEventKind::Update => self.push_update(event, at),
            FileEventKind::Add => self.push_add(event, at),
            FileEventKind::Delete => self.push_delete(event, at),
            FileEventKind::Move => self.push_move(event, at),
        }
    }

    fn push_update(&mut self, event: FileEvent, at: Instant) {
        if let Some(p) = self.pending.get_mut(&event.path) {
            if p.event.kind == FileEventKind::Delete {
                p.event.kind = FileEventKind::Update;
            }
            p.last_at = at;
            return;
        }
        let seq = self.next_seq();
        self.put(event, seq, at);
    }

    fn push_add(&mut self, event: FileEvent, at: Instant) {
        if let Some(p) = self.pending.get_mut(&event.path) {
            if p.event.kind == FileEventKind::Delete {
                p.event.kind = FileEventKind::Update;
            } else {
                p.event = FileEvent {
                    timestamp: p.event.timestamp,
                    ..event
                };
            }
            p.last_at = at;
            return;
        }
        let seq = self.next_seq();
        self.put(event, seq, at);
    }

    fn push_delete(&mut self, event: FileEvent, at: Instant) {
        let Some(prior) = self.pending.remove(&event.path) else {
            let seq = self.next_seq();
            self.put(event, seq, at);
            return;
        };

        match prior.event.kind {
            FileEventKind::Add => {}
            FileEventKind::Move => {
                let (Some(old_path), Some(old_root)) = (prior.event.old_path, prior.event.old_root)
                else {
                    return;
                };
                if let Some(p) = self.pending.get_mut(&old_path) {
                    // Something was re-created at the old path after the move.
                    if p.event.kind == FileEventKind::Add {
                        p.event.kind = FileEventKind::Update;
                    }
                    p.last_at = at;
                    return;
                }
                let delete = FileEvent {
                    timestamp: prior.event.timestamp,
                    ..FileEvent::delete(old_path, old_root)
                };
                self.put(delete, prior.seq, at);
            }
            FileEventKind::Update | FileEventKind::Delete => {
                let delete = FileEvent {
                    timestamp: prior.event.timestamp,
                    ..event
                };
                self.put(delete, prior.seq, at);
            }
        }
    }

    fn push_move(&mut self, event: FileEvent, at: Instant) {
        let Some(old_path) = event.old_path.clone() else {
            return;
        };
        let from_old = self.pending.remove(&old_path);
        let at_dest = self.pending.remove(&event.path);

        let seq = at_dest
            .as_ref()
            .map(|p| p.seq)
            .or_else(|| from_old.as_ref().map(|p| p.seq))
            .unwrap_or_else(|| self.next_seq());
        let timestamp = from_old
            .as_ref()
            .map_or(event.timestamp, |p| p.event.timestamp);

        let merged = match from_old.map(|p| p.event) {
            None | Some(FileEvent { kind: FileEventKind::Delete, .. }) => event,
            Some(FileEvent { kind: FileEventKind::Add, .. }) => FileEvent::add(event.path, event.root),
            Some(FileEvent { kind: FileEventKind::Update, root, .. }) => {
                // Content changed before the rename; re-index from scratch.
                let delete_seq = self.next_seq();
                self.put(FileEvent::delete(old_path, root), delete_seq, at);
                FileEvent::add(event.path, event.root)
            }
            Some(prior @ FileEvent { kind: FileEventKind::Move, .. }) => {
                match (prior.old_path, prior.old_root) {
                    (Some(origin), _) if origin == event.path => FileEvent::update(event.path, event.root),
                    (Some(origin), Some(origin_root)) => {
                        FileEvent::moved(origin, origin_root, event.path, event.root)
                    }
                    _ => event,
                }
            }
        };
        self.put(FileEvent { timestamp, ..merged }, seq, at);
    }

    /// Remove and return events quiet for at least the window, first-seen order.
    pub fn flush(&mut self, now: Instant) -> Vec<FileEvent> {
        self.flush_except(now, |_| false)
    }

    /// Like [`Debouncer::flush`], but paths for which `held` returns true stay pending.
    pub fn flush_except<F>(&mut self, now: Instant, held: F) -> Vec<FileEvent>
    where
        F: Fn(&Path) -> bool,
    {
        let window = self.window;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(path, p)| now.saturating_duration_since(p.last_at) >= window && !held(path))
            .map(|(path, _)| path.clone())
            .collect();
        let mut out: Vec<Pending> = ready
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .collect();
        out.sort_by_key(|p| p.seq);
        out.into_iter().map(|p| p.event).collect()
    }

    /// Remove and return everything pending, first-seen order.
    pub fn flush_all(&mut self) -> Vec<FileEvent> {
        let mut out: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        out.sort_by_key(|p| p.seq);
        out.into_iter().map(|p| p.event).collect()
    }

    /// Remove and return pending events whose path lies under `root`, first-seen order.
    pub fn take_under(&mut self, root: &Path) -> Vec<FileEvent> {
        let keys: Vec<PathBuf> = self
            .pending
            .keys()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect();
        let mut out: Vec<Pending> = keys.iter().filter_map(|k| self.pending.remove(k)).collect();
        out.sort_by_key(|p| p.seq);
        out.into_iter().map(|p| p.event).collect()
    }

    /// Drop pending events whose path lies under `root`.
    pub fn forget_under(&mut self, root: &Path) {
        self.pending.retain(|path, _| !path.starts_with(root));
    }

    /// Number of pending paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    fn kinds(events: &[FileEvent]) -> Vec<(FileEventKind, &Path)> {
        events.iter().map(|e| (e.kind, e.path.as_path())).collect()
    }

    #[test]
    fn test_held_path_stays_pending() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r/a", "/r"), t0);
        d.push(FileEvent::add("/r/b", "/r"), t0);

        let out = d.flush_except(t0 + WINDOW, |p| p == Path::new("/r/a"));
        assert_eq!(kinds(&out), vec![(FileEventKind::Add, Path::new("/r/b"))]);
        assert_eq!(d.len(), 1);

        d.push(FileEvent::delete("/r/a", "/r"), t0 + WINDOW);
        assert!(d.flush_all().is_empty());
    }

    #[test]
    fn test_updates_collapse() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        for i in 0..5 {
            d.push(FileEvent::update("/r/a", "/r"), t0 + Duration::from_millis(i * 10));
        }
        assert!(d.flush(t0 + Duration::from_millis(60)).is_empty());
        let out = d.flush(t0 + Duration::from_millis(90));
        assert_eq!(kinds(&out), vec![(FileEventKind::Update, Path::new("/r/a"))]);
    }

    #[test]
    fn test_add_then_update_is_add() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r/a", "/r"), t0);
        d.push(FileEvent::update("/r/a", "/r"), t0);
        assert_eq!(d.flush_all()[0].kind, FileEventKind::Add);
    }

    #[test]
    fn test_add_then_delete_cancels() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r/a", "/r"), t0);
        d.push(FileEvent::delete("/r/a", "/r"), t0);
        assert!(d.flush_all().is_empty());
    }

    #[test]
    fn test_delete_then_add_is_update() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::delete("/r/a", "/r"), t0);
        d.push(FileEvent::add("/r/a", "/r"), t0);
        assert_eq!(d.flush_all()[0].kind, FileEventKind::Update);
    }

    #[test]
    fn test_move_then_delete_deletes_origin() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::moved("/r/a", "/r", "/r/b", "/r"), t0);
        d.push(FileEvent::delete("/r/b", "/r"), t0);
        let out = d.flush_all();
        assert_eq!(kinds(&out), vec![(FileEventKind::Delete, Path::new("/r/a"))]);
    }

    #[test]
    fn test_add_then_move_is_add_at_destination() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r/a", "/r"), t0);
        d.push(FileEvent::moved("/r/a", "/r", "/r/b", "/r"), t0);
        let out = d.flush_all();
        assert_eq!(kinds(&out), vec![(FileEventKind::Add, Path::new("/r/b"))]);
    }

    #[test]
    fn test_chained_moves() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::moved("/r/a", "/r", "/r/b", "/r"), t0);
        d.push(FileEvent::moved("/r/b", "/r", "/r/c", "/r"), t0);
        let out = d.flush_all();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FileEventKind::Move);
        assert_eq!(out[0].old_path.as_deref(), Some(Path::new("/r/a")));
        assert_eq!(out[0].path, PathBuf::from("/r/c"));
    }

    #[test]
    fn test_update_then_move_reindexes() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::update("/r/a", "/r"), t0);
        d.push(FileEvent::moved("/r/a", "/r", "/r/b", "/r"), t0);
        let out = d.flush_all();
        assert_eq!(
            kinds(&out),
            vec![
                (FileEventKind::Add, Path::new("/r/b")),
                (FileEventKind::Delete, Path::new("/r/a")),
            ]
        );
    }

    #[test]
    fn test_flush_keeps_first_seen_order() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r/z", "/r"), t0);
        d.push(FileEvent::add("/r/a", "/r"), t0 + Duration::from_millis(1));
        d.push(FileEvent::update("/r/z", "/r"), t0 + Duration::from_millis(2));
        let out = d.flush(t0 + Duration::from_millis(100));
        assert_eq!(
            kinds(&out),
            vec![
                (FileEventKind::Add, Path::new("/r/z")),
                (FileEventKind::Add, Path::new("/r/a")),
            ]
        );
    }

    #[test]
    fn test_forget_under() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.push(FileEvent::add("/r1/a", "/r1"), t0);
        d.push(FileEvent::add("/r2/a", "/r2"), t0);
        d.forget_under(Path::new("/r1"));
        assert_eq!(d.len(), 1);
    }
}
