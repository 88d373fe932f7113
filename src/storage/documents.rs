//! Document storage operations.
//!
//! Paths are compared by exact string; "under a root" means equal to the root
//! or starting with the root followed by a path separator.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::chunks::{delete_chunks_for_document, parse_json, to_i64, to_usize};
use super::models::{now_unix, DocumentRecord};
use crate::error::StorageError;
use crate::Result;

const DOCUMENT_COLUMNS: &str =
    "path, content_hash, file_type, metadata, chunk_count, model_id, parsed_at, updated_at";

/// The prefix every path strictly under `root` starts with.
pub(crate) fn dir_prefix(root: &str) -> String {
    let sep = std::path::MAIN_SEPARATOR;
    if root.ends_with(sep) || root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}{sep}")
    }
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let metadata: String = row.get(3)?;
    Ok(DocumentRecord {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        file_type: row.get(2)?,
        metadata: parse_json(&metadata),
        chunk_count: to_usize(row.get(4)?),
        model_id: row.get(5)?,
        parsed_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Insert or replace a document row.
///
/// Replacing is done with an UPDATE so existing chunks are not cascaded away.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn upsert_document(conn: &Connection, doc: &DocumentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (path, content_hash, file_type, metadata, chunk_count, model_id, parsed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(path) DO UPDATE SET
            content_hash = excluded.content_hash,
            file_type = excluded.file_type,
            metadata = excluded.metadata,
            chunk_count = excluded.chunk_count,
            model_id = excluded.model_id,
            parsed_at = excluded.parsed_at,
            updated_at = excluded.updated_at",
        params![
            doc.path,
            doc.content_hash,
            doc.file_type,
            doc.metadata.to_string(),
            to_i64(doc.chunk_count),
            doc.model_id,
            doc.parsed_at,
            doc.updated_at,
        ],
    )
    .map_err(|e| StorageError::Database(format!("failed to upsert document: {e}")))?;
    Ok(())
}

/// Get a document by path.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_document(conn: &Connection, path: &str) -> Result<Option<DocumentRecord>> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE path = ?");
    conn.query_row(&sql, [path], row_to_document)
        .optional()
        .map_err(|e| StorageError::Database(format!("failed to get document: {e}")).into())
}

/// List documents ordered by path, optionally restricted to one root.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_documents(
    conn: &Connection,
    under: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<Vec<DocumentRecord>> {
    let (sql, prefix) = match under {
        Some(root) => (
            format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents
                 WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
                 ORDER BY path LIMIT ?3 OFFSET ?4"
            ),
            Some((root.to_string(), dir_prefix(root))),
        ),
        None => (
            format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY path LIMIT ?1 OFFSET ?2"),
            None,
        ),
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let rows = match prefix {
        Some((root, prefix)) => stmt.query_map(
            params![root, prefix, to_i64(limit), to_i64(offset)],
            row_to_document,
        ),
        None => stmt.query_map(params![to_i64(limit), to_i64(offset)], row_to_document),
    }
    .map_err(|e| StorageError::Database(format!("failed to list documents: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read document row: {e}")).into())
}

/// Paths and `updated_at` of every document under `root`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn document_paths_under(conn: &Connection, root: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT path, updated_at FROM documents
             WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
             ORDER BY path",
        )
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map(params![root, dir_prefix(root)], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(|e| StorageError::Database(format!("failed to query documents: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read document row: {e}")))?;
    Ok(rows)
}

/// Whether `path` is stored with this content hash under this model.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn document_is_current(
    conn: &Connection,
    path: &str,
    content_hash: &str,
    model_id: &str,
) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM documents WHERE path = ? AND content_hash = ? AND model_id = ?",
            params![path, content_hash, model_id],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| StorageError::Database(format!("failed to check document: {e}")))?;
    Ok(found.is_some())
}

/// Delete a document and its chunks. Returns the number of chunks removed.
///
/// Chunks are deleted explicitly before the document row so the full-text
/// triggers observe every removal.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_document(conn: &Connection, path: &str) -> Result<usize> {
    let removed = delete_chunks_for_document(conn, path)?;
    conn.execute("DELETE FROM documents WHERE path = ?", [path])
        .map_err(|e| StorageError::Database(format!("failed to delete document: {e}")))?;
    Ok(removed)
}

/// Delete every document under `root`. Returns `(documents, chunks)` removed.
///
/// # Errors
///
/// Returns an error if any delete fails.
pub fn delete_documents_under(conn: &Connection, root: &str) -> Result<(usize, usize)> {
    let paths = document_paths_under(conn, root)?;
    let mut chunks = 0;
    for (path, _) in &paths {
        chunks += delete_document(conn, path)?;
    }
    Ok((paths.len(), chunks))
}

/// Move a document to a new path, keeping its chunks and embeddings.
///
/// A document already stored at `new_path` is replaced. Returns `false` if
/// nothing was stored at `old_path`.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn rename_document(conn: &Connection, old_path: &str, new_path: &str) -> Result<bool> {
    if get_document(conn, old_path)?.is_none() {
        return Ok(false);
    }
    if old_path == new_path {
        return Ok(true);
    }
    delete_document(conn, new_path)?;

    conn.execute(
        "UPDATE documents SET path = ?, updated_at = ? WHERE path = ?",
        params![new_path, now_unix(), old_path],
    )
    .map_err(|e| StorageError::Database(format!("failed to rename document: {e}")))?;
    Ok(true)
}

/// Count documents.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_documents(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("failed to count documents: {e}")))?;
    Ok(u64::try_from(count).unwrap_or(0))
}
