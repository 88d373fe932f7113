//! Pairs deletes with later creates of the same file name into moves.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct PendingDelete {
    path: PathBuf,
    at: Instant,
    seq: u64,
}

/// Holds deletes for one correlation window, keyed by file name.
#[derive(Debug)]
pub struct MoveCorrelator {
    window: Duration,
    pending: HashMap<OsString, VecDeque<PendingDelete>>,
    seq: u64,
}

impl MoveCorrelator {
    /// New correlator with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// Defer a delete of `path` observed at `at`.
    pub fn record_delete(&mut self, path: PathBuf, at: Instant) {
        let Some(name) = path.file_name().map(ToOwned::to_owned) else {
            return;
        };
        self.seq += 1;
        self.pending.entry(name).or_default().push_back(PendingDelete {
            path,
            at,
            seq: self.seq,
        });
    }

    /// Claim the oldest pending delete sharing `path`'s file name that is
    /// still inside the window at `at`.
    ///
    /// A delete of the exact same path is preferred, so delete-then-recreate
    /// pairs with itself rather than with an unrelated file.
    pub fn take_match(&mut self, path: &Path, at: Instant) -> Option<PathBuf> {
        let name = path.file_name()?;
        let queue = self.pending.get_mut(name)?;
        let window = self.window;
        let live = |d: &PendingDelete| at.saturating_duration_since(d.at) < window;

        let index = queue
            .iter()
            .position(|d| d.path == path && live(d))
            .or_else(|| queue.iter().position(live))?;
        let claimed = queue.remove(index).map(|d| d.path);
        if queue.is_empty() {
            self.pending.remove(name);
        }
        claimed
    }

    /// Whether a delete of exactly `path` is being held.
    #[must_use]
    pub fn holds(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| self.pending.get(name))
            .is_some_and(|queue| queue.iter().any(|d| d.path == path))
    }

    /// Remove and return deletes whose window has elapsed, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<(PathBuf, Instant)> {
        let window = self.window;
        let mut expired = Vec::new();
        self.pending.retain(|_, queue| {
            queue.retain(|d| {
                if now.saturating_duration_since(d.at) >= window {
                    expired.push(d.clone());
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        Self::ordered(expired)
    }

    /// Remove and return every pending delete, oldest first.
    pub fn drain(&mut self) -> Vec<(PathBuf, Instant)> {
        let all = self.pending.drain().flat_map(|(_, q)| q).collect();
        Self::ordered(all)
    }

    /// Remove and return pending deletes under `root`, oldest first.
    pub fn take_under(&mut self, root: &Path) -> Vec<PathBuf> {
        let mut taken = Vec::new();
        self.pending.retain(|_, queue| {
            queue.retain(|d| {
                if d.path.starts_with(root) {
                    taken.push(d.clone());
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        Self::ordered(taken).into_iter().map(|(path, _)| path).collect()
    }

    /// Discard pending deletes under `root`.
    pub fn forget_under(&mut self, root: &Path) {
        self.take_under(root);
    }

    /// Number of deferred deletes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Whether nothing is deferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn ordered(mut items: Vec<PendingDelete>) -> Vec<(PathBuf, Instant)> {
        items.sort_by_key(|d| d.seq);
        items.into_iter().map(|d| (d.path, d.at)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_create_within_window_pairs() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/a/doc.pdf"), t0);

        let old = c.take_match(Path::new("/r/b/doc.pdf"), t0 + Duration::from_millis(40));
        assert_eq!(old, Some(PathBuf::from("/r/a/doc.pdf")));
        assert!(c.is_empty());
    }

    #[test]
    fn test_create_after_window_does_not_pair() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/a/doc.pdf"), t0);
        assert_eq!(c.take_match(Path::new("/r/b/doc.pdf"), t0 + WINDOW), None);
    }

    #[test]
    fn test_different_name_does_not_pair() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/a/doc.pdf"), t0);
        assert_eq!(c.take_match(Path::new("/r/a/doc2.pdf"), t0), None);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_same_path_preferred() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/x/notes.md"), t0);
        c.record_delete(PathBuf::from("/r/y/notes.md"), t0);
        assert_eq!(
            c.take_match(Path::new("/r/y/notes.md"), t0),
            Some(PathBuf::from("/r/y/notes.md"))
        );
    }

    #[test]
    fn test_holds_exact_path_only() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/a/doc.pdf"), t0);
        assert!(c.holds(Path::new("/r/a/doc.pdf")));
        assert!(!c.holds(Path::new("/r/b/doc.pdf")));
        c.expire(t0 + WINDOW);
        assert!(!c.holds(Path::new("/r/a/doc.pdf")));
    }

    #[test]
    fn test_expire_returns_in_delete_order() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r/b.txt"), t0);
        c.record_delete(PathBuf::from("/r/a.txt"), t0 + Duration::from_millis(10));
        c.record_delete(PathBuf::from("/r/c.txt"), t0 + Duration::from_millis(90));

        let expired = c.expire(t0 + Duration::from_millis(110));
        let paths: Vec<_> = expired.into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec![PathBuf::from("/r/b.txt"), PathBuf::from("/r/a.txt")]);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_forget_under_root() {
        let t0 = Instant::now();
        let mut c = MoveCorrelator::new(WINDOW);
        c.record_delete(PathBuf::from("/r1/a.txt"), t0);
        c.record_delete(PathBuf::from("/r2/a.txt"), t0);
        assert_eq!(c.take_under(Path::new("/r1")), vec![PathBuf::from("/r1/a.txt")]);
        c.forget_under(Path::new("/r1"));
        assert_eq!(c.drain(), vec![(PathBuf::from("/r2/a.txt"), t0)]);
    }
}
