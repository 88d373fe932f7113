//! `SQLite` database connection management.
//!
//! Provides a connection wrapper configured for:
//! - WAL mode so the watcher and indexer handles can share one file
//! - Serialized access to a single connection (via `parking_lot::Mutex`)
//! - Recovery from a corrupt database file

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StorageError;
use crate::Result;

/// How long a writer waits on another handle's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper.
///
/// Wraps a `SQLite` connection with proper configuration and locking.
/// Clone is cheap - it just clones the Arc.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl Database {
    /// Open a database at the given path.
    ///
    /// Creates the database file and parent directories if they don't exist.
    /// Configures WAL mode and performance settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::Database(format!("failed to open database: {e}")))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string_lossy().to_string(),
        };

        db.configure()?;

        Ok(db)
    }

    /// Open a database, replacing it with a fresh one if it is corrupt.
    ///
    /// A file that fails to open or fails `PRAGMA quick_check` is renamed to
    /// `<name>.corrupt-<unix>` and a new empty database is created in its
    /// place. Anything stored in the old file, queued events included, is lost;
    /// the rename keeps it around for manual inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement database cannot be created either.
    pub fn open_or_recover(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match Self::open(path).and_then(|db| db.quick_check().map(|()| db)) {
            Ok(db) => Ok(db),
            Err(e) if path.exists() => {
                let aside = corrupt_path(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Database failed integrity check, starting fresh; queued data may be lost"
                );
                std::fs::rename(path, &aside)?;
                for suffix in ["-wal", "-shm"] {
                    let side = PathBuf::from(format!("{}{suffix}", path.display()));
                    if side.exists() {
                        let _ = std::fs::remove_file(side);
                    }
                }
                Self::open(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StorageError::Database(format!("failed to open in-memory database: {e}"))
        })?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: ":memory:".to_string(),
        };

        db.configure()?;

        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        {
            let conn = self.conn.lock();

            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| StorageError::Database(format!("failed to set busy timeout: {e}")))?;

            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -64000;  -- 64MB cache
                PRAGMA temp_store = MEMORY;
                PRAGMA foreign_keys = ON;
                ",
            )
            .map_err(|e| StorageError::Database(format!("failed to configure database: {e}")))?;
        }

        tracing::debug!(path = %self.path, "Database configured with WAL mode");

        Ok(())
    }

    /// Execute a function with exclusive database access.
    ///
    /// # Errors
    ///
    /// Returns an error if the function fails.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function that may modify the database.
    ///
    /// Wraps the operation in an immediate transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or if the function fails.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StorageError::Database(format!("failed to begin transaction: {e}")))?;

        let tx_result = match f(&conn) {
            Ok(result) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(StorageError::Database(format!("failed to commit: {e}")).into());
                }
                Ok(result)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        };
        drop(conn);
        tx_result
    }

    /// Get the database path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the health check fails.
    pub fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StorageError::Database(format!("health check failed: {e}")).into())
        })
    }

    /// Run `PRAGMA quick_check`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a database or reports damage.
    pub fn quick_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            let verdict: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .map_err(|e| StorageError::Database(format!("quick_check failed: {e}")))?;
            if verdict == "ok" {
                Ok(())
            } else {
                Err(StorageError::Database(format!("quick_check reported: {verdict}")).into())
            }
        })
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().timestamp();
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "database".to_string());
    name.push_str(&format!(".corrupt-{stamp}"));
    path.with_file_name(name)
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.path(), ":memory:");
        db.health_check().unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dirs").join("test.db");

        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        db.health_check().unwrap();
    }

    #[test]
    fn test_with_transaction_rollback() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|conn| {
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])
                .map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = db.with_transaction(|conn| {
            conn.execute("INSERT INTO test (id) VALUES (1)", [])
                .map_err(|e| StorageError::Database(e.to_string()))?;
            Err(crate::Error::internal("simulated failure"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))
                    .map_err(|e| StorageError::Database(e.to_string()).into())
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_two_handles_share_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shared.db");

        let writer = Database::open(&path).unwrap();
        let reader = Database::open(&path).unwrap();

        writer
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
                    .map_err(|e| StorageError::Database(e.to_string()).into())
            })
            .unwrap();

        let value: i64 = reader
            .with_conn(|conn| {
                conn.query_row("SELECT v FROM t", [], |row| row.get(0))
                    .map_err(|e| StorageError::Database(e.to_string()).into())
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_open_or_recover_replaces_garbage_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docmirror.db");
        std::fs::write(&path, b"this is definitely not a sqlite database file at all").unwrap();

        let db = Database::open_or_recover(&path).unwrap();
        db.health_check().unwrap();
        db.quick_check().unwrap();

        let aside: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
    }

    #[test]
    fn test_open_or_recover_keeps_healthy_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docmirror.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute_batch("CREATE TABLE keep (v INTEGER); INSERT INTO keep VALUES (1);")
                    .map_err(|e| StorageError::Database(e.to_string()).into())
            })
            .unwrap();
        }

        let db = Database::open_or_recover(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM keep", [], |row| row.get(0))
                    .map_err(|e| StorageError::Database(e.to_string()).into())
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
