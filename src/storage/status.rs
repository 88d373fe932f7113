//! Watcher status key/value table.
//!
//! Written only by the watcher.

use rusqlite::{params, Connection, OptionalExtension};

use super::models::now_unix;
use crate::error::StorageError;
use crate::Result;

/// Key holding `"1"` while a watcher is running.
pub const WATCHER_RUNNING_KEY: &str = "running";

/// Set a status value.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_status(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO watcher_status (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_unix()],
    )
    .map_err(|e| StorageError::Database(format!("failed to set status: {e}")))?;
    Ok(())
}

/// Read a status value.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_status(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM watcher_status WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("failed to get status: {e}")).into())
}
