//! Database schema definitions and migrations.
//!
//! Provides versioned schema migrations for safe database upgrades.
//! Queue tables are not part of the schema; each `PersistentQueue` creates
//! its own table on construction.

use rusqlite::Connection;

use crate::error::StorageError;
use crate::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Tables every migrated database must contain.
const EXPECTED_TABLES: [&str; 9] = [
    "roots",
    "documents",
    "chunks",
    "embeddings",
    "document_embeddings",
    "chunks_fts",
    "activity_log",
    "failed_files",
    "watcher_status",
];

/// Run all pending migrations.
///
/// # Errors
///
/// Returns an error if migrations fail.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| StorageError::Migration(format!("failed to create migrations table: {e}")))?;

    let current_version = get_current_version(conn)?;
    tracing::info!(
        current = current_version,
        target = SCHEMA_VERSION,
        "Checking database migrations"
    );

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<i32> {
    let result = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    );

    match result {
        Ok(version) => Ok(version),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(StorageError::Migration(format!("failed to get version: {e}")).into()),
    }
}

fn record_migration(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)",
        rusqlite::params![version, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| StorageError::Migration(format!("failed to record migration: {e}")))?;

    Ok(())
}

/// Migration v1: roots, documents, chunks, embeddings, full-text index and bookkeeping.
fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Applying migration v1: Initial schema");

    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS roots (
            path TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            include_patterns TEXT NOT NULL DEFAULT '[]',  -- JSON array
            exclude_patterns TEXT NOT NULL DEFAULT '[]',  -- JSON array
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            file_type TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',  -- JSON object
            chunk_count INTEGER NOT NULL DEFAULT 0,
            model_id TEXT NOT NULL,
            parsed_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash);

        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            document_path TEXT NOT NULL
                REFERENCES documents(path) ON DELETE CASCADE ON UPDATE CASCADE,
            content TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_path, chunk_index)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_path);

        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY REFERENCES chunks(chunk_id) ON DELETE CASCADE,
            vector BLOB NOT NULL,
            model_id TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            embedded_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);

        CREATE TABLE IF NOT EXISTS document_embeddings (
            document_path TEXT PRIMARY KEY
                REFERENCES documents(path) ON DELETE CASCADE ON UPDATE CASCADE,
            vector BLOB NOT NULL,
            model_id TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            embedded_at INTEGER NOT NULL
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            content,
            chunk_id UNINDEXED,
            content='chunks',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, content, chunk_id)
            VALUES (NEW.rowid, NEW.content, NEW.chunk_id);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content, chunk_id)
            VALUES ('delete', OLD.rowid, OLD.content, OLD.chunk_id);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content, chunk_id)
            VALUES ('delete', OLD.rowid, OLD.content, OLD.chunk_id);
            INSERT INTO chunks_fts(rowid, content, chunk_id)
            VALUES (NEW.rowid, NEW.content, NEW.chunk_id);
        END;

        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            path TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_created ON activity_log(created_at);

        CREATE TABLE IF NOT EXISTS failed_files (
            path TEXT PRIMARY KEY,
            error TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 1,
            retry_after INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watcher_status (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )
    .map_err(|e| StorageError::Migration(format!("v1 migration failed: {e}")))?;

    record_migration(conn, 1)?;
    tracing::info!("Migration v1 complete");

    Ok(())
}

/// Verify all expected tables exist.
///
/// # Errors
///
/// Returns an error if any expected table is missing from the schema.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    for table in EXPECTED_TABLES {
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
                [table],
                |_| Ok(true),
            )
            .unwrap_or(false);

        if !exists {
            return Err(StorageError::Migration(format!("table '{table}' not found")).into());
        }
    }

    tracing::debug!("Schema verification passed");
    Ok(())
}
