//! `VectorStore`: the document/chunk/embedding facade used by the indexer.
//!
//! Every write to one document's chunk and embedding set happens inside a
//! single transaction, so searches never observe a half-updated document.

use super::chunks::{count_chunks, get_chunks_for_document, insert_chunk};
use super::documents::{
    count_documents, delete_document, delete_documents_under, document_is_current, get_document,
    list_documents, rename_document, upsert_document,
};
use super::failures::list_failures;
use super::models::{
    ChunkRecord, DocumentRecord, DocumentSearchResult, DocumentWrite, EmbeddedChunk,
    SearchResult, StoreStats,
};
use super::roots::count_roots;
use super::search::{keyword_search, search_chunks, search_documents, SearchOptions};
use super::vector::{check_dimensions, count_embeddings, insert_embedding, upsert_document_embedding};
use super::Database;
use crate::Result;

/// Persistent store of documents, chunks and embeddings.
#[derive(Debug, Clone)]
pub struct VectorStore {
    db: Database,
    model_id: String,
    dimensions: usize,
}

impl VectorStore {
    /// Wrap a migrated database for a given embedding model.
    #[must_use]
    pub fn new(db: Database, model_id: impl Into<String>, dimensions: usize) -> Self {
        Self {
            db,
            model_id: model_id.into(),
            dimensions,
        }
    }

    /// Underlying database handle.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Embedding model every stored vector must come from.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Expected vector dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn validate(&self, chunks: &[EmbeddedChunk], document_vector: Option<&[f32]>) -> Result<()> {
        for chunk in chunks {
            check_dimensions(&chunk.vector, self.dimensions)?;
        }
        if let Some(vector) = document_vector {
            check_dimensions(vector, self.dimensions)?;
        }
        Ok(())
    }

    /// Atomically replace everything stored for one document.
    ///
    /// Old chunks and embeddings are removed and the new set inserted in one
    /// transaction. Vectors are validated before anything is written.
    ///
    /// # Errors
    ///
    /// Returns a vector error on dimension mismatch, or a storage error if the
    /// transaction fails (in which case nothing changes).
    pub fn replace_document(&self, write: &DocumentWrite) -> Result<()> {
        self.validate(&write.chunks, write.document_vector.as_deref())?;
        if write.dimensions != self.dimensions {
            return Err(crate::error::StorageError::Vector(format!(
                "write declares {} dimensions, store expects {}",
                write.dimensions, self.dimensions
            ))
            .into());
        }

        let path = write.document.path.clone();
        self.db.with_transaction(|conn| {
            delete_document(conn, &path)?;
            upsert_document(conn, &write.document)?;
            for embedded in &write.chunks {
                insert_chunk(conn, &embedded.chunk)?;
                insert_embedding(conn, &embedded.chunk.chunk_id, &embedded.vector, &self.model_id)?;
            }
            if let Some(vector) = &write.document_vector {
                upsert_document_embedding(conn, &path, vector, &self.model_id, write.chunks.len())?;
            }
            Ok(())
        })?;

        tracing::debug!(path = %path, chunks = write.chunks.len(), "Stored document");
        Ok(())
    }

    /// Insert or update a document row without touching its chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn add_document(&self, document: &DocumentRecord) -> Result<()> {
        self.db.with_transaction(|conn| upsert_document(conn, document))
    }

    /// Append embedded chunks to documents that already exist.
    ///
    /// # Errors
    ///
    /// Returns an error on dimension mismatch or if any insert fails (nothing is written).
    pub fn add_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        self.validate(chunks, None)?;
        self.db.with_transaction(|conn| {
            for embedded in chunks {
                insert_chunk(conn, &embedded.chunk)?;
                insert_embedding(conn, &embedded.chunk.chunk_id, &embedded.vector, &self.model_id)?;
            }
            Ok(())
        })
    }

    /// Remove a document and everything hanging off it. Returns removed chunk count.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_document(&self, path: &str) -> Result<usize> {
        self.db.with_transaction(|conn| delete_document(conn, path))
    }

    /// Remove every document under a root. Returns `(documents, chunks)` removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_documents_under(&self, root: &str) -> Result<(usize, usize)> {
        self.db.with_transaction(|conn| delete_documents_under(conn, root))
    }

    /// Whether `path` is stored with this content hash (any model).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_exists(&self, path: &str, content_hash: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(get_document(conn, path)?.is_some_and(|d| d.content_hash == content_hash))
        })
    }

    /// Whether `path` is stored with this content hash under this store's model.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn document_is_current(&self, path: &str, content_hash: &str) -> Result<bool> {
        self.db
            .with_conn(|conn| document_is_current(conn, path, content_hash, &self.model_id))
    }

    /// Move a document to a new path, keeping chunks and embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn rename_document(&self, old_path: &str, new_path: &str) -> Result<bool> {
        self.db
            .with_transaction(|conn| rename_document(conn, old_path, new_path))
    }

    /// Get a document by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_document(&self, path: &str) -> Result<Option<DocumentRecord>> {
        self.db.with_conn(|conn| get_document(conn, path))
    }

    /// List documents ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_documents(
        &self,
        under: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DocumentRecord>> {
        self.db
            .with_conn(|conn| list_documents(conn, under, limit, offset))
    }

    /// Chunks of a document in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_chunks_for_document(&self, path: &str) -> Result<Vec<ChunkRecord>> {
        self.db.with_conn(|conn| get_chunks_for_document(conn, path))
    }

    /// Chunk-level cosine search.
    ///
    /// # Errors
    ///
    /// Returns an error on dimension mismatch or query failure.
    pub fn search(&self, query: &[f32], options: &SearchOptions) -> Result<Vec<SearchResult>> {
        check_dimensions(query, self.dimensions)?;
        self.db.with_conn(|conn| search_chunks(conn, query, options))
    }

    /// Document-level cosine search.
    ///
    /// # Errors
    ///
    /// Returns an error on dimension mismatch or query failure.
    pub fn search_documents(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<DocumentSearchResult>> {
        check_dimensions(query, self.dimensions)?;
        self.db.with_conn(|conn| search_documents(conn, query, options))
    }

    /// Full-text search over chunk content.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn keyword_search(&self, text: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.db.with_conn(|conn| keyword_search(conn, text, options))
    }

    /// Row counts.
    ///
    /// # Errors
    ///
    /// Returns an error if any count fails.
    pub fn stats(&self) -> Result<StoreStats> {
        self.db.with_conn(|conn| {
            Ok(StoreStats {
                documents: count_documents(conn)?,
                chunks: count_chunks(conn)?,
                embeddings: count_embeddings(conn)?,
                roots: count_roots(conn)?,
                failed_files: u64::try_from(list_failures(conn)?.len()).unwrap_or(0),
            })
        })
    }
}
