//! Error types and Result aliases for docmirror.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.

use thiserror::Error;

/// Result type alias using docmirror's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for docmirror operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database/storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Persistent queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Document parsing error.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Embedding generation error.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// File watching error.
    #[error("watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Server/API error.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The addressed entity does not exist.
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// The request itself is malformed.
    Invalid,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name used in JSON error bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Internal => "internal",
        }
    }
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// `SQLite` database error.
    #[error("database error: {0}")]
    Database(String),

    /// Record not found.
    #[error("not found: {entity} with id '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// Record already exists or overlaps an existing one.
    #[error("conflict: {entity} '{id}'")]
    Conflict { entity: &'static str, id: String },

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Vector operation error.
    #[error("vector error: {0}")]
    Vector(String),
}

/// Persistent queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Operation attempted after `close()`.
    #[error("queue '{0}' is closed")]
    Closed(String),

    /// Queue table name or contents are unusable.
    #[error("queue corrupt: {0}")]
    Corrupt(String),

    /// Payload could not be serialized.
    #[error("payload error: {0}")]
    Payload(String),
}

/// Document parsing errors.
#[derive(Error, Debug)]
pub enum ParseError {
    /// No registered parser handles this file.
    #[error("unsupported file type: {path}")]
    Unsupported { path: String },

    /// A parser accepted the file but could not extract text.
    #[error("failed to parse '{path}': {reason}")]
    Failed { path: String, reason: String },
}

/// Embedding-specific errors.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider rejected the credentials.
    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Provider rejected the request (non-retryable 4xx).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Rate limit, timeout or server error; safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Transient failures persisted past the retry budget.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Returned vectors do not match the configured model.
    #[error("expected {expected} dimensions, got {actual}")]
    Dimensions { expected: usize, actual: usize },

    /// Provider is misconfigured.
    #[error("embedding configuration error: {0}")]
    Config(String),
}

/// File watcher errors.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to watch path.
    #[error("failed to watch path '{path}': {reason}")]
    WatchFailed { path: String, reason: String },

    /// Root is not registered or does not exist.
    #[error("root not found: {0}")]
    RootNotFound(String),

    /// `start` called while already running.
    #[error("watcher is already running")]
    AlreadyRunning,

    /// Operation requires a running watcher.
    #[error("watcher is not running")]
    NotRunning,
}

/// Server/API errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Request handling error.
    #[error("request error: {0}")]
    Request(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-input error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Classify the error for API responses.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(StorageError::NotFound { .. })
            | Self::Watcher(WatcherError::RootNotFound(_)) => ErrorKind::NotFound,
            Self::Storage(StorageError::Conflict { .. })
            | Self::Watcher(WatcherError::AlreadyRunning) => ErrorKind::Conflict,
            Self::InvalidInput(_) | Self::Config(_) | Self::Parse(ParseError::Unsupported { .. }) => {
                ErrorKind::Invalid
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same work later may succeed.
    ///
    /// I/O failures count as transient because files under a watched root are
    /// frequently locked or half-written when first observed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Embedding(e) => e.is_retryable() || matches!(e, EmbeddingError::RetriesExhausted { .. }),
            Self::Storage(StorageError::Database(_)) | Self::Io(_) => true,
            _ => false,
        }
    }
}

impl StorageError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
        }
    }
}

impl ParseError {
    /// Create a parse failure for `path`.
    pub fn failed(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::Failed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl EmbeddingError {
    /// Whether the provider call can be retried as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
