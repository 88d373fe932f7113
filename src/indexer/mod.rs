//! Document indexing.
//!
//! ```text
//! event queue -> IndexerProcess -> ParserRegistry -> Chunker -> Embedder -> VectorStore
//! ```
//!
//! The indexer owns the roots table. Root changes are persisted here first
//! and then forwarded to the watcher as queued commands.

mod chunker;
mod locks;
pub mod parsers;
mod process;

pub use chunker::{Chunker, TextChunk};
pub use locks::{PathGuard, PathLocks};
pub use parsers::{ParsedDocument, Parser, ParserRegistry};
pub use process::{
    IndexOutcome, IndexerProcess, IndexerState, IndexerStats, IntegrityReport, ResyncReport,
};
