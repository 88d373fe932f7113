//! Similarity and keyword search.
//!
//! Vector search is exact: every stored embedding is scored with cosine
//! similarity and the best `top_k` are kept. Filters are applied before
//! ranking so `top_k` always counts matching chunks.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::chunks::{parse_json, row_to_chunk, to_usize, CHUNK_COLUMNS};
use super::documents::dir_prefix;
use super::models::{DocumentSearchResult, SearchResult};
use super::vector::{cosine_similarity, decode_vector};
use crate::error::StorageError;
use crate::Result;

/// Search options shared by all search flavours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Maximum number of results to return.
    pub top_k: usize,

    /// Minimum similarity score (0.0 to 1.0).
    pub min_score: f32,

    /// Only return chunks from these exact document paths.
    pub filter_paths: Vec<String>,

    /// Drop results under any of these roots.
    pub exclude_roots: Vec<String>,

    /// `*.ext` matches by suffix, anything else by substring.
    pub file_pattern: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: 0.0,
            filter_paths: Vec::new(),
            exclude_roots: Vec::new(),
            file_pattern: None,
        }
    }
}

impl SearchOptions {
    /// Create new search options with a result limit.
    #[must_use]
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }

    /// Set minimum similarity score.
    #[must_use]
    pub fn with_min_score(mut self, score: f32) -> Self {
        self.min_score = score.clamp(0.0, 1.0);
        self
    }

    /// Restrict to exact document paths.
    #[must_use]
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.filter_paths = paths;
        self
    }

    /// Exclude everything under a root.
    #[must_use]
    pub fn excluding_root(mut self, root: impl Into<String>) -> Self {
        self.exclude_roots.push(root.into());
        self
    }

    /// Filter by file pattern.
    #[must_use]
    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = Some(pattern.into());
        self
    }

    /// Whether a document path passes the path filters.
    #[must_use]
    pub fn accepts(&self, path: &str) -> bool {
        if !self.filter_paths.is_empty() && !self.filter_paths.iter().any(|p| p == path) {
            return false;
        }
        if self
            .exclude_roots
            .iter()
            .any(|root| path == root || path.starts_with(&dir_prefix(root)))
        {
            return false;
        }
        match self.file_pattern.as_deref() {
            Some(pattern) if pattern.starts_with("*.") => {
                path.to_lowercase().ends_with(&pattern[1..].to_lowercase())
            }
            Some(pattern) if !pattern.is_empty() => path.contains(pattern),
            _ => true,
        }
    }
}

fn sort_chunk_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
            .then_with(|| a.chunk.document_path.cmp(&b.chunk.document_path))
    });
}

/// Rank every stored chunk embedding against `query`.
///
/// Results are sorted by score descending, ties broken by `chunk_index`
/// ascending and then by path.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn search_chunks(
    conn: &Connection,
    query: &[f32],
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    if options.top_k == 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {CHUNK_COLUMNS}, e.vector FROM chunks c JOIN embeddings e ON e.chunk_id = c.chunk_id"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare search: {e}")))?;

    let rows = stmt
        .query_map([], |row| Ok((row_to_chunk(row, 0)?, row.get::<_, Vec<u8>>(7)?)))
        .map_err(|e| StorageError::Database(format!("failed to run search: {e}")))?;

    let mut results = Vec::new();
    for row in rows {
        let (chunk, blob) =
            row.map_err(|e| StorageError::Database(format!("failed to read search row: {e}")))?;
        if !options.accepts(&chunk.document_path) {
            continue;
        }
        let score = cosine_similarity(query, &decode_vector(&blob)?);
        if score >= options.min_score {
            results.push(SearchResult { chunk, score });
        }
    }

    sort_chunk_results(&mut results);
    results.truncate(options.top_k);
    Ok(results)
}

/// Rank documents by their document-level embedding.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn search_documents(
    conn: &Connection,
    query: &[f32],
    options: &SearchOptions,
) -> Result<Vec<DocumentSearchResult>> {
    if options.top_k == 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(
            "SELECT d.path, d.file_type, d.metadata, de.chunk_count, de.vector
             FROM documents d JOIN document_embeddings de ON de.document_path = d.path",
        )
        .map_err(|e| StorageError::Database(format!("failed to prepare search: {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })
        .map_err(|e| StorageError::Database(format!("failed to run search: {e}")))?;

    let mut results = Vec::new();
    for row in rows {
        let (path, file_type, metadata, chunk_count, blob) =
            row.map_err(|e| StorageError::Database(format!("failed to read search row: {e}")))?;
        if !options.accepts(&path) {
            continue;
        }
        let score = cosine_similarity(query, &decode_vector(&blob)?);
        if score >= options.min_score {
            results.push(DocumentSearchResult {
                path,
                file_type,
                metadata: parse_json(&metadata),
                chunk_count: to_usize(chunk_count),
                score,
            });
        }
    }

    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    results.truncate(options.top_k);
    Ok(results)
}

/// Quote each whitespace-separated token so FTS5 operators are taken literally.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn like_pattern(token: &str) -> String {
    let escaped = token
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Full-text search over chunk content.
///
/// Uses the FTS5 index ranked by bm25 (score `|bm25| / (1 + |bm25|)`, so
/// better matches score higher). If that finds nothing, falls back to a
/// case-insensitive substring match requiring every token, scored 1.0.
///
/// # Errors
///
/// Returns an error if the fallback query fails.
pub fn keyword_search(
    conn: &Connection,
    text: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let Some(query) = fts_query(text) else {
        return Ok(Vec::new());
    };
    if options.top_k == 0 {
        return Ok(Vec::new());
    }

    match keyword_search_fts(conn, &query, options) {
        Ok(results) if !results.is_empty() => return Ok(results),
        Ok(_) => {}
        Err(e) => tracing::warn!(query = %text, error = %e, "FTS keyword search failed"),
    }

    keyword_search_like(conn, text, options)
}

fn keyword_search_fts(
    conn: &Connection,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let sql = format!(
        "SELECT {CHUNK_COLUMNS}, bm25(chunks_fts) AS rank
         FROM chunks_fts JOIN chunks c ON c.rowid = chunks_fts.rowid
         WHERE chunks_fts MATCH ?
         ORDER BY rank"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare keyword search: {e}")))?;

    let rows = stmt
        .query_map([query], |row| Ok((row_to_chunk(row, 0)?, row.get::<_, f64>(7)?)))
        .map_err(|e| StorageError::Database(format!("failed to run keyword search: {e}")))?;

    let mut results = Vec::new();
    for row in rows {
        let (chunk, rank) = row
            .map_err(|e| StorageError::Database(format!("failed to read keyword row: {e}")))?;
        if !options.accepts(&chunk.document_path) {
            continue;
        }
        let magnitude = rank.abs();
        #[allow(clippy::cast_possible_truncation)]
        let score = (magnitude / (1.0 + magnitude)) as f32;
        if score >= options.min_score {
            results.push(SearchResult { chunk, score });
        }
    }

    sort_chunk_results(&mut results);
    results.truncate(options.top_k);
    Ok(results)
}

fn keyword_search_like(
    conn: &Connection,
    text: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let tokens: Vec<String> = text.split_whitespace().map(like_pattern).collect();
    let conditions = vec!["c.content LIKE ? ESCAPE '\\'"; tokens.len()].join(" AND ");
    let sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE {conditions}
         ORDER BY c.document_path, c.chunk_index"
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare keyword search: {e}")))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(tokens.iter()), |row| {
            row_to_chunk(row, 0)
        })
        .map_err(|e| StorageError::Database(format!("failed to run keyword search: {e}")))?;

    let mut results = Vec::new();
    for row in rows {
        let chunk =
            row.map_err(|e| StorageError::Database(format!("failed to read keyword row: {e}")))?;
        if options.accepts(&chunk.document_path) {
            results.push(SearchResult { chunk, score: 1.0 });
        }
        if results.len() >= options.top_k {
            break;
        }
    }
    Ok(results)
}
