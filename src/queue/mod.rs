//! Durable FIFO queues backed by `SQLite`.
//!
//! A [`PersistentQueue`] owns one table of `(id, payload, status, created_at,
//! updated_at)` rows. Items move `pending -> processing -> done`; a crash
//! between [`PersistentQueue::dequeue`] and [`PersistentQueue::ack`] leaves
//! them in `processing`, and [`PersistentQueue::requeue_unacked`] puts them
//! back at startup. Delivery is at-least-once, so consumers must be idempotent.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{params, params_from_iter, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, StorageError};
use crate::storage::Database;
use crate::Result;

/// Table holding [`crate::watcher::WatcherCommand`]s.
pub const COMMAND_QUEUE_TABLE: &str = "watcher_commands";

/// Table holding [`crate::watcher::FileEvent`]s.
pub const EVENT_QUEUE_TABLE: &str = "file_events";

const PENDING: &str = "pending";
const PROCESSING: &str = "processing";
const DONE: &str = "done";

/// An item handed out by [`PersistentQueue::dequeue`] or [`PersistentQueue::peek`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem<T> {
    /// Row id; pass to `ack`/`nack`.
    pub id: i64,
    /// Decoded payload.
    pub payload: T,
}

/// A durable, crash-recoverable FIFO of JSON-encoded payloads.
pub struct PersistentQueue<T> {
    db: Database,
    table: String,
    closed: AtomicBool,
    _payload: PhantomData<fn() -> T>,
}

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn db_err(action: &str, e: &rusqlite::Error) -> crate::Error {
    StorageError::Database(format!("failed to {action}: {e}")).into()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<T> PersistentQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (creating if needed) the queue stored in `table`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Corrupt` for an unusable table name, or a storage
    /// error if the table cannot be created.
    pub fn open(db: Database, table: &str) -> Result<Self> {
        if !valid_table_name(table) {
            return Err(QueueError::Corrupt(format!("invalid queue table name '{table}'")).into());
        }

        db.with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, id);"
            ))
            .map_err(|e| db_err("create queue table", &e))
        })?;

        Ok(Self {
            db,
            table: table.to_string(),
            closed: AtomicBool::new(false),
            _payload: PhantomData,
        })
    }

    /// Table name backing this queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.table
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.table.clone()).into());
        }
        Ok(())
    }

    fn encode(payload: &T) -> Result<String> {
        serde_json::to_string(payload).map_err(|e| QueueError::Payload(e.to_string()).into())
    }

    fn insert(&self, conn: &Connection, payload: &str) -> Result<i64> {
        let now = now_millis();
        conn.execute(
            &format!(
                "INSERT INTO {} (payload, status, created_at, updated_at) VALUES (?, ?, ?, ?)",
                self.table
            ),
            params![payload, PENDING, now, now],
        )
        .map_err(|e| db_err("enqueue", &e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Append one item. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the insert fails.
    pub fn enqueue(&self, payload: &T) -> Result<i64> {
        self.ensure_open()?;
        let encoded = Self::encode(payload)?;
        self.db.with_conn(|conn| self.insert(conn, &encoded))
    }

    /// Append several items atomically, preserving their order. Returns their ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or any insert fails (none are kept).
    pub fn enqueue_batch(&self, payloads: &[T]) -> Result<Vec<i64>> {
        self.ensure_open()?;
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = payloads
            .iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>>>()?;
        self.db.with_transaction(|conn| {
            encoded
                .iter()
                .map(|payload| self.insert(conn, payload))
                .collect()
        })
    }

    fn select_pending(&self, conn: &Connection, limit: usize) -> Result<Vec<(i64, String)>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, payload FROM {} WHERE status = ? ORDER BY id LIMIT ?",
                self.table
            ))
            .map_err(|e| db_err("prepare dequeue", &e))?;
        let rows = stmt
            .query_map(
                params![PENDING, i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| db_err("select pending items", &e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("read queue row", &e))?;
        Ok(rows)
    }

    fn set_status(&self, conn: &Connection, ids: &[i64], status: &str, only_from: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE status = ? AND id IN ({placeholders})",
            self.table
        );
        let mut values: Vec<rusqlite::types::Value> = vec![
            status.to_string().into(),
            now_millis().into(),
            only_from.to_string().into(),
        ];
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(*id)));
        conn.execute(&sql, params_from_iter(values))
            .map_err(|e| db_err("update queue status", &e))
    }

    /// Hand out up to `batch_size` pending items in FIFO order, marking them `processing`.
    ///
    /// Rows whose payload no longer decodes are logged and marked `done` so
    /// they cannot block the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the transaction fails.
    pub fn dequeue(&self, batch_size: usize) -> Result<Vec<QueueItem<T>>> {
        self.ensure_open()?;
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        self.db.with_transaction(|conn| {
            let rows = self.select_pending(conn, batch_size)?;
            let mut items = Vec::with_capacity(rows.len());
            let mut taken = Vec::with_capacity(rows.len());
            let mut retired = Vec::new();

            for (id, payload) in rows {
                match serde_json::from_str(&payload) {
                    Ok(payload) => {
                        taken.push(id);
                        items.push(QueueItem { id, payload });
                    }
                    Err(e) => {
                        tracing::warn!(queue = %self.table, id, error = %e, "Retiring undecodable queue item");
                        retired.push(id);
                    }
                }
            }

            self.set_status(conn, &taken, PROCESSING, PENDING)?;
            self.set_status(conn, &retired, DONE, PENDING)?;
            Ok(items)
        })
    }

    /// Look at up to `limit` pending items without changing their state.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the query fails.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueueItem<T>>> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            Ok(self
                .select_pending(conn, limit)?
                .into_iter()
                .filter_map(|(id, payload)| {
                    serde_json::from_str(&payload)
                        .ok()
                        .map(|payload| QueueItem { id, payload })
                })
                .collect())
        })
    }

    /// Mark processing items as done. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the update fails.
    pub fn ack(&self, ids: &[i64]) -> Result<usize> {
        self.ensure_open()?;
        self.db
            .with_transaction(|conn| self.set_status(conn, ids, DONE, PROCESSING))
    }

    /// Return processing items to pending so they are delivered again.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the update fails.
    pub fn nack(&self, ids: &[i64]) -> Result<usize> {
        self.ensure_open()?;
        self.db
            .with_transaction(|conn| self.set_status(conn, ids, PENDING, PROCESSING))
    }

    /// Reset every `processing` item to `pending`. Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the update fails.
    pub fn requeue_unacked(&self) -> Result<usize> {
        self.ensure_open()?;
        let count = self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE {} SET status = ?, updated_at = ? WHERE status = ?",
                    self.table
                ),
                params![PENDING, now_millis(), PROCESSING],
            )
            .map_err(|e| db_err("requeue unacked items", &e))
        })?;
        if count > 0 {
            tracing::info!(queue = %self.table, count, "Requeued unacknowledged items");
        }
        Ok(count)
    }

    fn count_where(&self, clause: &str) -> Result<u64> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {} {clause}", self.table),
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| db_err("count queue items", &e))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    /// Number of pending items.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the query fails.
    pub fn size(&self) -> Result<u64> {
        self.count_where("WHERE status = 'pending'")
    }

    /// Number of rows in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the query fails.
    pub fn total_size(&self) -> Result<u64> {
        self.count_where("")
    }

    /// Delete every row.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the delete fails.
    pub fn clear(&self) -> Result<usize> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {}", self.table), [])
                .map_err(|e| db_err("clear queue", &e))
        })
    }

    /// Delete acknowledged rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is closed or the delete fails.
    pub fn purge_done(&self) -> Result<usize> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {} WHERE status = ?", self.table),
                [DONE],
            )
            .map_err(|e| db_err("purge done items", &e))
        })
    }

    /// Refuse all further operations on this handle.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> std::fmt::Debug for PersistentQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("table", &self.table)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        n: u32,
    }

    fn queue() -> PersistentQueue<Job> {
        PersistentQueue::open(Database::open_in_memory().unwrap(), "jobs").unwrap()
    }

    fn numbers(items: &[QueueItem<Job>]) -> Vec<u32> {
        items.iter().map(|i| i.payload.n).collect()
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        for n in 0..4 {
            q.enqueue(&Job { n }).unwrap();
        }
        assert_eq!(numbers(&q.dequeue(2).unwrap()), vec![0, 1]);
        assert_eq!(numbers(&q.dequeue(10).unwrap()), vec![2, 3]);
        assert!(q.dequeue(10).unwrap().is_empty());
    }

    #[test]
    fn test_requeue_after_crash_redelivers_in_order() {
        let q = queue();
        for n in 0..5 {
            q.enqueue(&Job { n }).unwrap();
        }
        let in_flight = q.dequeue(3).unwrap();
        assert_eq!(in_flight.len(), 3);
        assert_eq!(q.size().unwrap(), 2);

        assert_eq!(q.requeue_unacked().unwrap(), 3);
        assert_eq!(numbers(&q.dequeue(10).unwrap()), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_ack_and_nack() {
        let q = queue();
        q.enqueue_batch(&[Job { n: 1 }, Job { n: 2 }]).unwrap();
        let items = q.dequeue(2).unwrap();

        assert_eq!(q.ack(&[items[0].id]).unwrap(), 1);
        assert_eq!(q.nack(&[items[1].id]).unwrap(), 1);
        // Already done: a second ack changes nothing.
        assert_eq!(q.ack(&[items[0].id]).unwrap(), 0);

        assert_eq!(q.requeue_unacked().unwrap(), 0);
        assert_eq!(numbers(&q.dequeue(5).unwrap()), vec![2]);
        assert_eq!(q.total_size().unwrap(), 2);
        assert_eq!(q.purge_done().unwrap(), 1);
    }

    #[test]
    fn test_peek_does_not_claim() {
        let q = queue();
        q.enqueue(&Job { n: 9 }).unwrap();
        assert_eq!(numbers(&q.peek(5).unwrap()), vec![9]);
        assert_eq!(q.size().unwrap(), 1);
        assert_eq!(numbers(&q.dequeue(5).unwrap()), vec![9]);
    }

    #[test]
    fn test_undecodable_payload_is_retired() {
        let db = Database::open_in_memory().unwrap();
        let q: PersistentQueue<Job> = PersistentQueue::open(db.clone(), "jobs").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (payload, status, created_at, updated_at) VALUES ('{not json', 'pending', 0, 0)",
                [],
            )
            .unwrap();
            Ok(())
        })
        .unwrap();
        q.enqueue(&Job { n: 1 }).unwrap();

        assert_eq!(numbers(&q.dequeue(5).unwrap()), vec![1]);
        assert_eq!(q.size().unwrap(), 0);
    }

    #[test]
    fn test_closed_queue_rejects_operations() {
        let q = queue();
        q.close();
        assert!(q.is_closed());
        let err = q.enqueue(&Job { n: 1 }).unwrap_err();
        assert!(matches!(err, crate::Error::Queue(QueueError::Closed(_))));
        assert!(q.dequeue(1).is_err());
    }

    #[test]
    fn test_invalid_table_name() {
        let db = Database::open_in_memory().unwrap();
        assert!(PersistentQueue::<Job>::open(db.clone(), "jobs; DROP TABLE x").is_err());
        assert!(PersistentQueue::<Job>::open(db, "9jobs").is_err());
    }

    #[test]
    fn test_two_queues_are_independent() {
        let db = Database::open_in_memory().unwrap();
        let a: PersistentQueue<Job> = PersistentQueue::open(db.clone(), "queue_a").unwrap();
        let b: PersistentQueue<Job> = PersistentQueue::open(db, "queue_b").unwrap();
        a.enqueue(&Job { n: 1 }).unwrap();
        assert_eq!(b.size().unwrap(), 0);
        assert_eq!(a.clear().unwrap(), 1);
    }
}
