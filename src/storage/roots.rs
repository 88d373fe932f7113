//! Watched-root persistence.
//!
//! Only the indexer writes here; the watcher reads enabled roots at startup.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::RootRecord;
use crate::error::StorageError;
use crate::Result;

fn row_to_root(row: &Row<'_>) -> rusqlite::Result<RootRecord> {
    let include: String = row.get(2)?;
    let exclude: String = row.get(3)?;
    Ok(RootRecord {
        path: row.get(0)?,
        enabled: row.get::<_, i64>(1)? != 0,
        include_patterns: serde_json::from_str(&include).unwrap_or_default(),
        exclude_patterns: serde_json::from_str(&exclude).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

/// Insert a root. Returns `false` if the path is already registered.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_root(conn: &Connection, root: &RootRecord) -> Result<bool> {
    let include = serde_json::to_string(&root.include_patterns)
        .map_err(|e| StorageError::Database(format!("failed to encode patterns: {e}")))?;
    let exclude = serde_json::to_string(&root.exclude_patterns)
        .map_err(|e| StorageError::Database(format!("failed to encode patterns: {e}")))?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO roots (path, enabled, include_patterns, exclude_patterns, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                root.path,
                i64::from(root.enabled),
                include,
                exclude,
                root.created_at
            ],
        )
        .map_err(|e| StorageError::Database(format!("failed to insert root: {e}")))?;
    Ok(inserted == 1)
}

/// Get a root by path.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_root(conn: &Connection, path: &str) -> Result<Option<RootRecord>> {
    conn.query_row(
        "SELECT path, enabled, include_patterns, exclude_patterns, created_at FROM roots WHERE path = ?",
        [path],
        row_to_root,
    )
    .optional()
    .map_err(|e| StorageError::Database(format!("failed to get root: {e}")).into())
}

/// List roots ordered by path.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_roots(conn: &Connection, enabled_only: bool) -> Result<Vec<RootRecord>> {
    let sql = if enabled_only {
        "SELECT path, enabled, include_patterns, exclude_patterns, created_at FROM roots
         WHERE enabled = 1 ORDER BY path"
    } else {
        "SELECT path, enabled, include_patterns, exclude_patterns, created_at FROM roots ORDER BY path"
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| StorageError::Database(format!("failed to prepare query: {e}")))?;

    let roots = stmt
        .query_map([], row_to_root)
        .map_err(|e| StorageError::Database(format!("failed to list roots: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Database(format!("failed to read root row: {e}")))?;
    Ok(roots)
}

/// Delete a root row. Returns `false` if it did not exist.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn delete_root(conn: &Connection, path: &str) -> Result<bool> {
    let removed = conn
        .execute("DELETE FROM roots WHERE path = ?", [path])
        .map_err(|e| StorageError::Database(format!("failed to delete root: {e}")))?;
    Ok(removed == 1)
}

/// Enable or disable a root.
///
/// # Errors
///
/// Returns `NotFound` if the root does not exist.
pub fn set_root_enabled(conn: &Connection, path: &str, enabled: bool) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE roots SET enabled = ? WHERE path = ?",
            params![i64::from(enabled), path],
        )
        .map_err(|e| StorageError::Database(format!("failed to update root: {e}")))?;
    if changed == 0 {
        return Err(StorageError::not_found("root", path).into());
    }
    Ok(())
}

/// Count roots.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_roots(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM roots", [], |row| row.get(0))
        .map_err(|e| StorageError::Database(format!("failed to count roots: {e}")))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrate, Database};

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| migrate(conn)).unwrap();
        db
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = setup();
        db.with_conn(|conn| {
            assert!(insert_root(conn, &RootRecord::new("/docs"))?);
            assert!(!insert_root(conn, &RootRecord::new("/docs"))?);
            assert_eq!(count_roots(conn)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_patterns_roundtrip_and_enable_flag() {
        let db = setup();
        db.with_conn(|conn| {
            let mut root = RootRecord::new("/docs");
            root.exclude_patterns = vec!["*.bak".to_string()];
            insert_root(conn, &root)?;
            insert_root(conn, &RootRecord::new("/notes"))?;

            set_root_enabled(conn, "/notes", false)?;
            let enabled = list_roots(conn, true)?;
            assert_eq!(enabled.len(), 1);
            assert_eq!(enabled[0].exclude_patterns, vec!["*.bak"]);
            assert!(!get_root(conn, "/notes")?.unwrap().enabled);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_set_enabled_unknown_root() {
        let db = setup();
        let err = db
            .with_conn(|conn| set_root_enabled(conn, "/nope", true))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_root() {
        let db = setup();
        db.with_conn(|conn| {
            insert_root(conn, &RootRecord::new("/docs"))?;
            assert!(delete_root(conn, "/docs")?);
            assert!(!delete_root(conn, "/docs")?);
            Ok(())
        })
        .unwrap();
    }
}
