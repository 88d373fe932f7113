//! Queue-side handle to the watcher.
//!
//! The indexer never talks to a [`super::WatcherProcess`] directly; it sends
//! [`WatcherCommand`]s and consumes [`FileEvent`]s through this client, which
//! opens the same queue tables on its own database handle.

use std::path::Path;

use super::events::{FileEvent, WatcherCommand};
use crate::queue::{PersistentQueue, QueueItem, COMMAND_QUEUE_TABLE, EVENT_QUEUE_TABLE};
use crate::storage::{get_status, Database, WATCHER_RUNNING_KEY};
use crate::Result;

/// Command sender and event consumer.
#[derive(Debug)]
pub struct WatcherClient {
    db: Database,
    commands: PersistentQueue<WatcherCommand>,
    events: PersistentQueue<FileEvent>,
}

impl WatcherClient {
    /// Open both queues on `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue tables cannot be created.
    pub fn open(db: Database) -> Result<Self> {
        Ok(Self {
            commands: PersistentQueue::open(db.clone(), COMMAND_QUEUE_TABLE)?,
            events: PersistentQueue::open(db.clone(), EVENT_QUEUE_TABLE)?,
            db,
        })
    }

    /// Ask the watcher to start watching `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn add_root(&self, root: &Path) -> Result<i64> {
        self.commands.enqueue(&WatcherCommand::add_root(root))
    }

    /// Ask the watcher to stop watching `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn remove_root(&self, root: &Path) -> Result<i64> {
        self.commands.enqueue(&WatcherCommand::remove_root(root))
    }

    /// Ask the watcher to shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn shutdown(&self) -> Result<i64> {
        self.commands.enqueue(&WatcherCommand::shutdown())
    }

    /// Take up to `batch_size` events, marking them in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn next_events(&self, batch_size: usize) -> Result<Vec<QueueItem<FileEvent>>> {
        self.events.dequeue(batch_size)
    }

    /// Mark events done.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn ack(&self, ids: &[i64]) -> Result<usize> {
        self.events.ack(ids)
    }

    /// Return events to the queue for redelivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn nack(&self, ids: &[i64]) -> Result<usize> {
        self.events.nack(ids)
    }

    /// Put events left in flight by a crashed consumer back in the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn requeue_unacked(&self) -> Result<usize> {
        self.events.requeue_unacked()
    }

    /// Events waiting to be consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub fn pending_events(&self) -> Result<u64> {
        self.events.size()
    }

    /// Commands the watcher has not consumed yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub fn pending_commands(&self) -> Result<u64> {
        self.commands.size()
    }

    /// Drop acknowledged rows from both queues.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_done(&self) -> Result<usize> {
        Ok(self.events.purge_done()? + self.commands.purge_done()?)
    }

    /// Whether a watcher has flagged itself as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the status table cannot be read.
    pub fn watcher_running(&self) -> Result<bool> {
        self.db
            .with_conn(|conn| Ok(get_status(conn, WATCHER_RUNNING_KEY)?.as_deref() == Some("1")))
    }
}
