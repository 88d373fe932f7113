//! File-change watcher.
//!
//! Turns raw filesystem notifications into a durable stream of semantic
//! [`FileEvent`]s:
//!
//! ```text
//! FSWatcherPool -> EventProcessor (MoveCorrelator + Debouncer) -> event queue
//! ```
//!
//! Control flows the other way through the command queue, via
//! [`WatcherClient`] on the indexer side and [`WatcherProcess`] here.

pub mod clock;
mod client;
mod correlator;
mod debouncer;
mod events;
pub mod filter;
mod pool;
mod process;
mod processor;
mod root_manager;

pub use client::WatcherClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use correlator::MoveCorrelator;
pub use debouncer::Debouncer;
pub use events::{
    now_millis, CommandKind, FileEvent, FileEventKind, RawKind, RawNotification, WatcherCommand,
};
pub use filter::{FileFilter, DEFAULT_IGNORE_PATTERNS};
pub use pool::{translate, FSWatcherPool, WatchSignal};
pub use process::{WatcherProcess, WatcherState};
pub use processor::{EventProcessor, ProcessorTiming};
pub use root_manager::RootManager;
