//! Vector storage and similarity helpers.
//!
//! Vectors are stored as little-endian `f32` blobs and compared with exact
//! cosine similarity computed in Rust.

use rusqlite::{params, Connection, OptionalExtension};

use super::models::now_unix;
use crate::error::StorageError;
use crate::Result;

/// Encode a vector as a little-endian `f32` blob.
#[must_use]
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a little-endian `f32` blob.
///
/// # Errors
///
/// Returns an error if the blob length is not a multiple of four.
pub fn decode_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StorageError::Vector(format!(
            "blob length {} is not a multiple of 4",
            blob.len()
        ))
        .into());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Zero vectors and mismatched lengths score 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot = x.mul_add(*y, dot);
        norm_a = x.mul_add(*x, norm_a);
        norm_b = y.mul_add(*y, norm_b);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector {
            *v /= norm;
        }
    }
}

/// Length-weighted mean of chunk vectors, normalized.
///
/// `parts` pairs each vector with the character length of its chunk.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weighted_mean(parts: &[(&[f32], usize)]) -> Option<Vec<f32>> {
    let dims = parts.first()?.0.len();
    let total: usize = parts.iter().map(|(_, len)| (*len).max(1)).sum();
    let mut mean = vec![0.0_f32; dims];
    for (vector, len) in parts {
        let weight = (*len).max(1) as f32 / total as f32;
        for (m, v) in mean.iter_mut().zip(vector.iter()) {
            *m = v.mul_add(weight, *m);
        }
    }
    normalize(&mut mean);
    Some(mean)
}

/// Check a vector against the expected dimensions.
///
/// # Errors
///
/// Returns a vector error on mismatch.
pub fn check_dimensions(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(StorageError::Vector(format!(
            "vector has {} dimensions, expected {expected}",
            vector.len()
        ))
        .into())
    }
}

/// Store the embedding of one chunk.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_embedding(
    conn: &Connection,
    chunk_id: &str,
    vector: &[f32],
    model_id: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO embeddings (chunk_id, vector, model_id, dimensions, embedded_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            chunk_id,
            encode_vector(vector),
            model_id,
            i64::try_from(vector.len()).unwrap_or(i64::MAX),
            now_unix()
        ],
    )
    .map_err(|e| StorageError::Database(format!("failed to insert embedding: {e}")))?;
    Ok(())
}

/// Store the document-level embedding.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn upsert_document_embedding(
    conn: &Connection,
    document_path: &str,
    vector: &[f32],
    model_id: &str,
    chunk_count: usize,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO document_embeddings
         (document_path, vector, model_id, dimensions, chunk_count, embedded_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            document_path,
            encode_vector(vector),
            model_id,
            i64::try_from(vector.len()).unwrap_or(i64::MAX),
            i64::try_from(chunk_count).unwrap_or(i64::MAX),
            now_unix()
        ],
    )
    .map_err(|e| StorageError::Database(format!("failed to insert document embedding: {e}")))?;
    Ok(())
}

/// Fetch a chunk's embedding.
///
/// # Errors
///
/// Returns an error if the query fails or the blob is malformed.
pub fn get_embedding(conn: &Connection, chunk_id: &str) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT vector FROM embeddings WHERE chunk_id = ?",
            [chunk_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::Database(format!("failed to get embedding: {e}")))?;
    blob.map(|b| decode_vector(&b)).transpose()
}

/// Count stored chunk embeddings.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_embeddings(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("failed to count embeddings: {e}")))?;
    Ok(u64::try_from(count).unwrap_or(0))
}
