//! Failed-file bookkeeping for the indexer's retry schedule.

use rusqlite::{params, Connection};

use super::models::{now_unix, FailedFile};
use crate::error::StorageError;
use crate::Result;

/// Record a failed attempt, scheduling the next one `retry_after_secs` from now.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn record_failure(
    conn: &Connection,
    path: &str,
    error: &str,
    retry_after_secs: u64,
) -> Result<()> {
    let now = now_unix();
    let retry_at = now.saturating_add(i64::try_from(retry_after_secs).unwrap_or(i64::MAX));
    conn.execute(
        "INSERT INTO failed_files (path, error, attempts, retry_after, updated_at)
         VALUES (?1, ?2, 1, ?3, ?4)
         ON CONFLICT(path) DO UPDATE SET
            error = excluded.error,
            attempts = failed_files.attempts + 1,
            retry_after = excluded.retry_after,
            updated_at = excluded.updated_at",
        params![path, error, retry_at, now],
    )
    .map_err(|e| StorageError::Database(format!("failed to record failure: {e}")))?;
    Ok(())
}

/// Forget a path's failure record.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn clear_failure(conn: &Connection, path: &str) -> Result<()> {
    conn.execute("DELETE FROM failed_files WHERE path = ?", [path])
        .map_err(|e| StorageError::Database(format!("failed to clear failure: {e}")))?;
    Ok(())
}

/// Failures whose retry time is at or before `now`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn due_failures(conn: &Connection, now: i64) -> Result<Vec<FailedFile>> {
    query_failures(
        conn,
        "SELECT path, error, attempts, retry_after FROM failed_files
         WHERE retry_after <= ? ORDER BY retry_after",
        Some(now),
    )
}

/// Every recorded failure.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_failures(conn: &Connection) -> Result<Vec<FailedFile>> {
    query_failures(
        conn,
        "SELECT path, error, attempts, retry_after FROM failed_files ORDER BY path",
        None,
    )
}

fn query_failures(conn: &Connection, sql: &str, now: Option<i64>) -> Result<Vec<FailedFile>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;
    let map = |row: &rusqlite::Row<'_>| {
        Ok(FailedFile {
            path: row.get(0)?,
            error: row.get(1)?,
            attempts: u32::try_from(row.get::<_, i64>(2)?).unwrap_or(u32::MAX),
            retry_after: row.get(3)?,
        })
    };
    let rows = match now {
        Some(now) => stmt.query_map([now], map),
        None => stmt.query_map([], map),
    }
    .map_err(|e| StorageError::Database(format!("failed to query failures: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read failure row: {e}")).into())
}
