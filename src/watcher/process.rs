//! The watcher process: observers, event processing and the two queues.
//!
//! Reads roots from the database once at startup and never writes them.
//! Afterwards its root set changes only through queued [`WatcherCommand`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::events::{CommandKind, FileEvent, WatcherCommand};
use super::pool::{FSWatcherPool, WatchSignal};
use super::processor::{EventProcessor, ProcessorTiming};
use super::root_manager::RootManager;
use crate::config::WatcherConfig;
use crate::error::WatcherError;
use crate::queue::{PersistentQueue, COMMAND_QUEUE_TABLE, EVENT_QUEUE_TABLE};
use crate::storage::{get_status, list_roots, set_status, Database, WATCHER_RUNNING_KEY};
use crate::Result;

const COMMAND_BATCH: usize = 16;
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    /// Not started, or fully stopped.
    Stopped,
    /// Loading roots and starting observers.
    Starting,
    /// Loops running.
    Running,
    /// Draining and shutting down.
    Stopping,
}

/// Everything the background loops share.
struct Shared {
    db: Database,
    roots: Arc<RootManager>,
    pool: FSWatcherPool,
    processor: EventProcessor,
    commands: PersistentQueue<WatcherCommand>,
    events: PersistentQueue<FileEvent>,
    signals: Receiver<WatchSignal>,
    /// Events flushed from the processor that the queue has not accepted yet.
    unpublished: Mutex<Vec<FileEvent>>,
}

impl Shared {
    /// Enqueue `events` behind any earlier batch that failed to publish.
    ///
    /// On failure the whole backlog is kept for the next attempt. Returns
    /// `true` once nothing is left unpublished.
    fn publish(&self, events: Vec<FileEvent>) -> bool {
        let mut backlog = self.unpublished.lock();
        backlog.extend(events);
        if backlog.is_empty() {
            return true;
        }
        match self.events.enqueue_batch(&backlog) {
            Ok(ids) => {
                tracing::debug!(count = ids.len(), "Published file events");
                backlog.clear();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, held = backlog.len(), "Failed to publish file events, will retry");
                false
            }
        }
    }

    fn unpublished(&self) -> usize {
        self.unpublished.lock().len()
    }

    fn watch(&self, root: &Path) {
        if let Err(e) = self.pool.start_watching(root) {
            tracing::warn!(root = %root.display(), error = %e, "Cannot watch root");
        }
        let files = self.processor.seed_root(root);
        tracing::info!(root = %root.display(), files, "Root loaded");
    }

    fn unwatch(&self, root: &Path) {
        self.roots.remove_root(root);
        self.pool.stop_watching(root);
        self.processor.forget_root(root);
    }

    /// Apply one command. Returns `true` for shutdown.
    fn apply(&self, command: &WatcherCommand) -> bool {
        match (command.kind, command.root.as_deref()) {
            (CommandKind::AddRoot, Some(root)) => {
                if self.roots.add_root(root) {
                    self.watch(root);
                } else {
                    tracing::debug!(root = %root.display(), "Root already watched");
                }
                false
            }
            (CommandKind::RemoveRoot, Some(root)) => {
                self.unwatch(root);
                tracing::info!(root = %root.display(), "Root removed");
                false
            }
            (CommandKind::Shutdown, _) => true,
            (kind, None) => {
                tracing::warn!(?kind, "Command without root ignored");
                false
            }
        }
    }

    /// Consume pending commands. Returns `true` if shutdown was requested.
    fn drain_commands(&self) -> bool {
        let batch = match self.commands.dequeue(COMMAND_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read commands");
                return false;
            }
        };

        let mut shutdown = false;
        let mut done = Vec::with_capacity(batch.len());
        for item in batch {
            shutdown |= self.apply(&item.payload);
            done.push(item.id);
        }
        if let Err(e) = self.commands.ack(&done) {
            tracing::error!(error = %e, "Failed to ack commands");
        }
        shutdown
    }

    fn handle_signal(&self, signal: WatchSignal) {
        match signal {
            WatchSignal::Raw(raw) => self.processor.process(raw),
            WatchSignal::Failed { root, reason } => {
                if !self.roots.contains(&root) {
                    return;
                }
                tracing::warn!(root = %root.display(), %reason, "Restarting observer");
                if let Err(e) = self.pool.restart(&root) {
                    tracing::error!(root = %root.display(), error = %e, "Observer restart failed");
                }
            }
        }
    }

    /// Roots whose directory vanished: delete everything known under them, stop watching.
    fn reap_vanished_roots(&self) {
        for root in self.roots.get_roots() {
            if root.is_dir() {
                continue;
            }
            self.roots.remove_root(&root);
            self.pool.stop_watching(&root);
            let deletes = self.processor.drop_root(&root);
            tracing::warn!(root = %root.display(), files = deletes.len(), "Root disappeared");
            self.publish(deletes);
        }
    }

    fn tick(&self) {
        self.reap_vanished_roots();
        let ready = self.processor.flush();
        self.publish(ready);
    }

    fn set_running(&self, running: bool) {
        let value = if running { "1" } else { "0" };
        if let Err(e) = self
            .db
            .with_conn(|conn| set_status(conn, WATCHER_RUNNING_KEY, value))
        {
            tracing::warn!(error = %e, "Failed to record watcher status");
        }
    }
}

/// Watches roots and publishes [`FileEvent`]s to the event queue.
pub struct WatcherProcess {
    config: WatcherConfig,
    shared: Arc<Shared>,
    state: Mutex<WatcherState>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherProcess {
    /// Create a stopped watcher on its own database handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue tables cannot be opened.
    pub fn new(db: Database, config: WatcherConfig) -> Result<Self> {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    /// Like [`Self::new`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue tables cannot be opened.
    pub fn with_clock(db: Database, config: WatcherConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let (sender, signals) = crossbeam_channel::unbounded();
        let roots = Arc::new(RootManager::new());
        let timing = ProcessorTiming {
            debounce: config.debounce(),
            move_correlation: config.move_correlation(),
        };

        let shared = Shared {
            commands: PersistentQueue::open(db.clone(), COMMAND_QUEUE_TABLE)?,
            events: PersistentQueue::open(db.clone(), EVENT_QUEUE_TABLE)?,
            pool: FSWatcherPool::new(sender, config.ignore_patterns.clone(), Arc::clone(&clock)),
            processor: EventProcessor::new(
                Arc::clone(&roots),
                clock,
                timing,
                config.ignore_patterns.clone(),
            ),
            roots,
            signals,
            db,
            unpublished: Mutex::new(Vec::new()),
        };

        Ok(Self {
            config,
            shared: Arc::new(shared),
            state: Mutex::new(WatcherState::Stopped),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Load roots, recover in-flight queue items, start observers and spawn
    /// the loops on the current runtime. Returns once running.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` unless stopped, or a storage error if roots
    /// or queues cannot be read.
    pub fn start_async(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Stopped {
                return Err(WatcherError::AlreadyRunning.into());
            }
            *state = WatcherState::Starting;
        }

        if let Err(e) = self.load() {
            *self.state.lock() = WatcherState::Stopped;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        let tasks = vec![
            self.spawn_command_loop(cancel.clone()),
            self.spawn_signal_loop(cancel.clone()),
            self.spawn_flush_loop(cancel),
        ];
        *self.tasks.lock() = tasks;

        self.shared.set_running(true);
        *self.state.lock() = WatcherState::Running;
        tracing::info!(roots = self.shared.roots.len(), "Watcher running");
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let shared = &self.shared;
        let roots = shared.db.with_conn(|conn| list_roots(conn, true))?;

        let commands = shared.commands.requeue_unacked()?;
        let events = shared.events.requeue_unacked()?;
        if commands + events > 0 {
            tracing::info!(commands, events, "Requeued unacknowledged items");
        }

        for record in roots {
            let root = record.path_buf();
            if shared.roots.add_root(root.clone()) {
                shared.watch(&root);
            }
        }
        Ok(())
    }

    fn spawn_command_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let period = self.config.process_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // Adding a root walks its tree; keep that off the runtime threads.
                        let worker = Arc::clone(&shared);
                        let shutdown = tokio::task::spawn_blocking(move || worker.drain_commands())
                            .await
                            .unwrap_or_else(|e| {
                                tracing::error!(error = %e, "Command drain panicked");
                                false
                            });
                        if shutdown {
                            tracing::info!("Shutdown command received");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_signal_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || loop {
            match shared.signals.recv_timeout(SIGNAL_POLL) {
                Ok(signal) => shared.handle_signal(signal),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if cancel.is_cancelled() {
                while let Ok(signal) = shared.signals.try_recv() {
                    shared.handle_signal(signal);
                }
                break;
            }
        })
    }

    fn spawn_flush_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let period = self.config.flush_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => shared.tick(),
                }
            }
        })
    }

    /// Resolves once the watcher has been asked to stop.
    pub async fn wait_for_shutdown(&self) {
        let cancel = self.cancel.lock().clone();
        cancel.cancelled().await;
    }

    /// Start, then run until a shutdown command or [`Self::stop`], then stop.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails.
    pub async fn run(&self) -> Result<()> {
        self.start_async()?;
        self.wait_for_shutdown().await;
        self.stop().await
    }

    /// Stop the loops, publish everything still pending and drop all observers.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the watcher was not running.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Running {
                return Err(WatcherError::NotRunning.into());
            }
            *state = WatcherState::Stopping;
        }

        self.cancel.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Watcher task failed");
            }
        }

        let shared = &self.shared;
        shared.pool.stop_all();
        let remaining = shared.processor.flush_all();
        let flushed = remaining.len();
        if !shared.publish(remaining) {
            tracing::error!(
                held = shared.unpublished(),
                "File events still unpublished at stop, kept for the next start"
            );
        }
        for root in shared.roots.get_roots() {
            shared.roots.remove_root(&root);
            shared.processor.forget_root(&root);
        }
        shared.set_running(false);

        *self.state.lock() = WatcherState::Stopped;
        tracing::info!(flushed, "Watcher stopped");
        Ok(())
    }

    /// Queue an `AddRoot` command. Does not wait for it to apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn add_root(&self, root: impl Into<PathBuf>) -> Result<i64> {
        self.shared.commands.enqueue(&WatcherCommand::add_root(root))
    }

    /// Queue a `RemoveRoot` command. Does not wait for it to apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn remove_root(&self, root: impl Into<PathBuf>) -> Result<i64> {
        self.shared.commands.enqueue(&WatcherCommand::remove_root(root))
    }

    /// Queue a `Shutdown` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be queued.
    pub fn shutdown(&self) -> Result<i64> {
        self.shared.commands.enqueue(&WatcherCommand::shutdown())
    }

    /// Roots currently watched, sorted.
    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        self.shared.roots.get_roots().into_iter().collect()
    }

    /// Events published but not yet consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub fn event_queue_size(&self) -> Result<u64> {
        self.shared.events.size()
    }

    /// Commands not yet applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub fn command_queue_size(&self) -> Result<u64> {
        self.shared.commands.size()
    }

    /// Whether any watcher sharing `db` has flagged itself as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the status table cannot be read.
    pub fn check_running(db: &Database) -> Result<bool> {
        db.with_conn(|conn| Ok(get_status(conn, WATCHER_RUNNING_KEY)?.as_deref() == Some("1")))
    }
}

impl std::fmt::Debug for WatcherProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherProcess")
            .field("state", &self.state())
            .field("roots", &self.roots())
            .finish_non_exhaustive()
    }
}
