//! Activity log.

use rusqlite::{params, Connection};

use super::chunks::to_i64;
use super::models::{now_unix, ActivityEntry};
use crate::error::StorageError;
use crate::Result;

/// Append an entry to the activity log.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn log_activity(conn: &Connection, kind: &str, message: &str, path: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO activity_log (kind, message, path, created_at) VALUES (?, ?, ?, ?)",
        params![kind, message, path, now_unix()],
    )
    .map_err(|e| StorageError::Database(format!("failed to log activity: {e}")))?;
    Ok(())
}

/// Most recent entries first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn recent_activity(conn: &Connection, limit: usize) -> Result<Vec<ActivityEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, message, path, created_at FROM activity_log
             ORDER BY id DESC LIMIT ?",
        )
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let entries = stmt
        .query_map([to_i64(limit)], |row| {
            Ok(ActivityEntry {
                id: row.get(0)?,
                kind: row.get(1)?,
                message: row.get(2)?,
                path: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .map_err(|e| StorageError::Database(format!("failed to query activity: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read activity row: {e}")))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrate, Database};

    #[test]
    fn test_recent_activity_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            migrate(conn)?;
            log_activity(conn, "root_added", "Added root /docs", Some("/docs"))?;
            log_activity(conn, "resync", "Resync finished", None)?;

            let entries = recent_activity(conn, 10)?;
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].kind, "resync");
            assert_eq!(entries[1].path.as_deref(), Some("/docs"));

            assert_eq!(recent_activity(conn, 1)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
