//! Chunk storage operations.

use rusqlite::{params, Connection, Row};

use super::models::ChunkRecord;
use crate::error::StorageError;
use crate::Result;

pub(crate) const CHUNK_COLUMNS: &str =
    "c.chunk_id, c.document_path, c.content, c.start_offset, c.end_offset, c.chunk_index, c.metadata";

pub(crate) fn parse_json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
}

pub(crate) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Map a row selected with [`CHUNK_COLUMNS`] starting at `offset`.
pub(crate) fn row_to_chunk(row: &Row<'_>, offset: usize) -> rusqlite::Result<ChunkRecord> {
    let metadata: String = row.get(offset + 6)?;
    Ok(ChunkRecord {
        chunk_id: row.get(offset)?,
        document_path: row.get(offset + 1)?,
        content: row.get(offset + 2)?,
        start_offset: to_usize(row.get(offset + 3)?),
        end_offset: to_usize(row.get(offset + 4)?),
        chunk_index: to_usize(row.get(offset + 5)?),
        metadata: parse_json(&metadata),
    })
}

/// Insert a chunk.
///
/// # Errors
///
/// Returns an error if the insertion fails (including a missing owning document).
pub fn insert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO chunks (chunk_id, document_path, content, start_offset, end_offset, chunk_index, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            chunk.chunk_id,
            chunk.document_path,
            chunk.content,
            to_i64(chunk.start_offset),
            to_i64(chunk.end_offset),
            to_i64(chunk.chunk_index),
            chunk.metadata.to_string(),
        ],
    )
    .map_err(|e| StorageError::Database(format!("failed to insert chunk: {e}")))?;

    tracing::trace!(chunk_id = %chunk.chunk_id, path = %chunk.document_path, "Inserted chunk");
    Ok(())
}

/// Get all chunks of a document ordered by `chunk_index`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_chunks_for_document(conn: &Connection, path: &str) -> Result<Vec<ChunkRecord>> {
    let sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.document_path = ? ORDER BY c.chunk_index"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let chunks = stmt
        .query_map([path], |row| row_to_chunk(row, 0))
        .map_err(|e| StorageError::Database(format!("failed to query chunks: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read chunk row: {e}")))?;

    Ok(chunks)
}

/// Count all chunks.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_chunks(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("failed to count chunks: {e}")))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Count chunks stored for one document.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_chunks_for_document(conn: &Connection, path: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_path = ?",
            [path],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(format!("failed to count chunks: {e}")))?;
    Ok(to_usize(count))
}

/// Chunk ids of a document that have no embedding row.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn chunks_missing_embeddings(conn: &Connection, path: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT c.chunk_id FROM chunks c
             LEFT JOIN embeddings e ON e.chunk_id = c.chunk_id
             WHERE c.document_path = ? AND e.chunk_id IS NULL
             ORDER BY c.chunk_index",
        )
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let ids = stmt
        .query_map([path], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("failed to query chunks: {e}")))?
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read chunk row: {e}")))?;
    Ok(ids)
}

/// Delete every chunk of a document. Returns the number removed.
///
/// Embeddings go with them through the foreign-key cascade.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_chunks_for_document(conn: &Connection, path: &str) -> Result<usize> {
    conn.execute("DELETE FROM chunks WHERE document_path = ?", [path])
        .map_err(|e| StorageError::Database(format!("failed to delete chunks: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrate, Database};

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            migrate(conn)?;
            conn.execute(
                "INSERT INTO documents (path, content_hash, file_type, model_id, parsed_at, updated_at)
                 VALUES ('/docs/a.md', 'h', 'md', 'm', 0, 0)",
                [],
            )
            .unwrap();
            Ok(())
        })
        .unwrap();
        db
    }

    fn chunk(id: &str, index: usize) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            document_path: "/docs/a.md".to_string(),
            content: format!("chunk {index}"),
            start_offset: index * 10,
            end_offset: index * 10 + 7,
            chunk_index: index,
            metadata: serde_json::json!({"section": "Intro"}),
        }
    }

    #[test]
    fn test_insert_and_list_in_index_order() {
        let db = setup();
        db.with_conn(|conn| {
            insert_chunk(conn, &chunk("b", 1))?;
            insert_chunk(conn, &chunk("a", 0))?;

            let chunks = get_chunks_for_document(conn, "/docs/a.md")?;
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0].chunk_id, "a");
            assert_eq!(chunks[1].chunk_index, 1);
            assert_eq!(chunks[0].metadata["section"], "Intro");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_insert_requires_document() {
        let db = setup();
        db.with_conn(|conn| {
            let mut orphan = chunk("x", 0);
            orphan.document_path = "/docs/missing.md".to_string();
            assert!(insert_chunk(conn, &orphan).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_missing_embeddings_and_delete() {
        let db = setup();
        db.with_conn(|conn| {
            insert_chunk(conn, &chunk("a", 0))?;
            insert_chunk(conn, &chunk("b", 1))?;
            crate::storage::vector::insert_embedding(conn, "a", &[1.0, 0.0], "m")?;

            assert_eq!(chunks_missing_embeddings(conn, "/docs/a.md")?, vec!["b"]);
            assert_eq!(delete_chunks_for_document(conn, "/docs/a.md")?, 2);
            assert_eq!(count_chunks(conn)?, 0);
            assert_eq!(crate::storage::vector::count_embeddings(conn)?, 0);
            Ok(())
        })
        .unwrap();
    }
}
