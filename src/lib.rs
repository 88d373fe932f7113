//! docmirror library
//!
//! Keeps a searchable, semantically indexed mirror of a set of watched folders.
//!
//! Two cooperating units make up the core:
//! - [`watcher::WatcherProcess`] turns raw filesystem notifications into a durable,
//!   deduplicated stream of [`watcher::FileEvent`]s.
//! - [`indexer::IndexerProcess`] consumes that stream and maintains documents, chunks
//!   and embeddings in the [`storage::VectorStore`].
//!
//! They only talk through the two [`queue::PersistentQueue`] tables.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod queue;
pub mod server;
pub mod storage;
pub mod watcher;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
