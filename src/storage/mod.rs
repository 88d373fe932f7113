//! `SQLite` storage for the document mirror.
//!
//! This module provides persistent storage for:
//! - Watched roots (written by the indexer only)
//! - Documents, chunks and embeddings behind the [`VectorStore`] facade
//! - The activity log and failed-file retry schedule
//! - The watcher's running-status flag

mod activity;
mod chunks;
mod connection;
mod documents;
mod failures;
mod models;
mod roots;
mod schema;
mod search;
mod status;
mod store;
mod vector;

pub use activity::{log_activity, recent_activity};
pub use chunks::{
    chunks_missing_embeddings, count_chunks, count_chunks_for_document, delete_chunks_for_document,
    get_chunks_for_document, insert_chunk,
};
pub use connection::Database;
pub use documents::{
    count_documents, delete_document, delete_documents_under, document_is_current,
    document_paths_under, get_document, list_documents, rename_document, upsert_document,
};
pub use failures::{clear_failure, due_failures, list_failures, record_failure};
pub use models::{
    ActivityEntry, ChunkRecord, DocumentRecord, DocumentSearchResult, DocumentWrite,
    EmbeddedChunk, FailedFile, RootRecord, SearchResult, StoreStats,
};
pub use roots::{count_roots, delete_root, get_root, insert_root, list_roots, set_root_enabled};
pub use schema::{migrate, verify_schema, SCHEMA_VERSION};
pub use search::{keyword_search, search_chunks, search_documents, SearchOptions};
pub use status::{get_status, set_status, WATCHER_RUNNING_KEY};
pub use store::VectorStore;
pub use vector::{
    check_dimensions, cosine_similarity, count_embeddings, decode_vector, encode_vector,
    get_embedding, insert_embedding, normalize, upsert_document_embedding, weighted_mean,
};

/// Initialize storage with migrations.
///
/// # Errors
///
/// Returns an error if database initialization fails.
pub fn init_storage(db: &Database) -> crate::Result<()> {
    db.with_conn(|conn| {
        migrate(conn)?;
        verify_schema(conn)?;

        tracing::info!("Storage initialized, schema version {SCHEMA_VERSION}");
        Ok(())
    })
}
