//! Data models for storage operations.
//!
//! This module defines the records read from and written to the database:
//! - Documents, chunks and their embeddings
//! - Watched roots
//! - Activity log entries and failed-file bookkeeping
//! - Search results and store statistics

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current Unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// An indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Absolute path, unique.
    pub path: String,

    /// blake3 hex digest of the raw file bytes.
    pub content_hash: String,

    /// Lowercase extension without the dot (`"md"`, `"pdf"`).
    pub file_type: String,

    /// Parser-supplied metadata.
    pub metadata: serde_json::Value,

    /// Number of stored chunks.
    pub chunk_count: usize,

    /// Embedding model used for this document's vectors.
    pub model_id: String,

    /// Unix timestamp of the parse that produced the stored chunks.
    pub parsed_at: i64,

    /// Unix timestamp of the last write to this row.
    pub updated_at: i64,
}

/// A span of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique chunk identifier.
    pub chunk_id: String,

    /// Owning document path.
    pub document_path: String,

    /// Chunk text.
    pub content: String,

    /// Character offset of the first character.
    pub start_offset: usize,

    /// Character offset one past the last character.
    pub end_offset: usize,

    /// Position within the document (0-based).
    pub chunk_index: usize,

    /// Free-form chunk metadata (section heading, etc).
    pub metadata: serde_json::Value,
}

/// A chunk paired with its embedding vector, ready to store.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    /// The chunk.
    pub chunk: ChunkRecord,

    /// Its vector.
    pub vector: Vec<f32>,
}

/// A full replacement of one document's indexed state.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    /// Document row.
    pub document: DocumentRecord,

    /// Chunks with embeddings, ordered by `chunk_index`.
    pub chunks: Vec<EmbeddedChunk>,

    /// Document-level vector.
    pub document_vector: Option<Vec<f32>>,

    /// Dimensions every vector must have.
    pub dimensions: usize,
}

/// A watched root folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    /// Canonical absolute path.
    pub path: String,

    /// Disabled roots are kept but neither watched nor resynced.
    pub enabled: bool,

    /// Glob patterns a file must match to be indexed (empty means all).
    pub include_patterns: Vec<String>,

    /// Glob patterns that exclude a file.
    pub exclude_patterns: Vec<String>,

    /// Unix timestamp when the root was added.
    pub created_at: i64,
}

impl RootRecord {
    /// Create an enabled root with no filters.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            created_at: now_unix(),
        }
    }

    /// Root path as a `PathBuf`.
    #[must_use]
    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// One line of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Row id.
    pub id: i64,

    /// Short machine-readable kind (`root_added`, `index_failed`, ...).
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Related path, if any.
    pub path: Option<String>,

    /// Unix timestamp.
    pub created_at: i64,
}

/// A file whose last indexing attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    /// File path.
    pub path: String,

    /// Last error message.
    pub error: String,

    /// Number of failed attempts so far.
    pub attempts: u32,

    /// Unix timestamp after which the file should be retried.
    pub retry_after: i64,
}

/// A chunk-level search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matching chunk.
    pub chunk: ChunkRecord,

    /// Similarity in `[0, 1]`.
    pub score: f32,
}

/// A document-level search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSearchResult {
    /// Document path.
    pub path: String,

    /// Document file type.
    pub file_type: String,

    /// Parser metadata.
    pub metadata: serde_json::Value,

    /// Number of chunks the document vector was built from.
    pub chunk_count: usize,

    /// Similarity in `[0, 1]`.
    pub score: f32,
}

/// Row counts for dashboards and `/api/v1/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Documents.
    pub documents: u64,
    /// Chunks.
    pub chunks: u64,
    /// Chunk embeddings.
    pub embeddings: u64,
    /// Roots (enabled or not).
    pub roots: u64,
    /// Files waiting for a retry.
    pub failed_files: u64,
}
