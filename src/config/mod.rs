//! Configuration management for docmirror.
//!
//! Values come from command-line arguments with `DOCMIRROR_*` environment
//! fallbacks (see `main.rs`), layered over the defaults defined here.

mod settings;

pub use settings::{
    ChunkingConfig, Config, EmbeddingConfig, EmbeddingProvider, IndexerConfig, ServerConfig,
    WatcherConfig,
};
