//! Configuration settings and validation.

use std::path::PathBuf;
use std::time::Duration;

use crate::watcher::filter::{validate_patterns, DEFAULT_IGNORE_PATTERNS};
use crate::{Error, Result};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration for docmirror.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the `SQLite` database.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub log_json: bool,

    /// Roots registered at startup if not already present.
    pub initial_roots: Vec<PathBuf>,

    /// HTTP server.
    pub server: ServerConfig,

    /// File watcher.
    pub watcher: WatcherConfig,

    /// Indexer worker pool.
    pub indexer: IndexerConfig,

    /// Chunk sizing.
    pub chunking: ChunkingConfig,

    /// Embedding provider.
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_json: false,
            initial_roots: Vec::new(),
            server: ServerConfig::default(),
            watcher: WatcherConfig::default(),
            indexer: IndexerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        self.server.validate()?;
        self.watcher.validate()?;
        self.indexer.validate()?;
        self.chunking.validate()?;
        self.embedding.validate()
    }

    /// Path to the `SQLite` database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("docmirror.db")
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port cannot be 0"));
        }
        if self.host.is_empty() {
            return Err(Error::config("host cannot be empty"));
        }
        Ok(())
    }

    /// `host:port`.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Watcher timing and filtering.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Move correlation window in milliseconds.
    pub move_correlation_ms: u64,
    /// Flush timer period in milliseconds.
    pub flush_interval_ms: u64,
    /// Command queue poll period in milliseconds.
    pub process_interval_ms: u64,
    /// Gitignore-style patterns never reported.
    pub ignore_patterns: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            move_correlation_ms: 100,
            flush_interval_ms: 100,
            process_interval_ms: 100,
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

impl WatcherConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("debounce_ms", self.debounce_ms),
            ("move_correlation_ms", self.move_correlation_ms),
            ("flush_interval_ms", self.flush_interval_ms),
            ("process_interval_ms", self.process_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} cannot be 0")));
            }
        }
        validate_patterns(&self.ignore_patterns)
    }

    /// Debounce window.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Move correlation window.
    #[must_use]
    pub const fn move_correlation(&self) -> Duration {
        Duration::from_millis(self.move_correlation_ms)
    }

    /// Flush timer period.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Command poll period.
    #[must_use]
    pub const fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

/// Indexer worker settings.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Files processed in parallel.
    pub max_concurrent_files: usize,
    /// Delay before a failed file is retried.
    pub retry_failed_after_seconds: u64,
    /// Event queue poll period in milliseconds.
    pub process_interval_ms: u64,
    /// Events dequeued per poll.
    pub event_batch_size: usize,
    /// Diff roots against the index at startup.
    pub resync_on_start: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 4,
            retry_failed_after_seconds: 300,
            process_interval_ms: 100,
            event_batch_size: 32,
            resync_on_start: true,
        }
    }
}

impl IndexerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrent_files == 0 {
            return Err(Error::config("max_concurrent_files cannot be 0"));
        }
        if self.event_batch_size == 0 {
            return Err(Error::config("event_batch_size cannot be 0"));
        }
        if self.process_interval_ms == 0 {
            return Err(Error::config("indexer process_interval_ms cannot be 0"));
        }
        Ok(())
    }

    /// Queue poll period.
    #[must_use]
    pub const fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

/// Chunk sizes, in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Target chunk length.
    pub chunk_size: usize,
    /// Trailing context carried into the next chunk.
    pub chunk_overlap: usize,
    /// Chunks shorter than this merge into a neighbour.
    pub min_chunk_size: usize,
    /// Paragraphs longer than this are split by sentence.
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            max_chunk_size: 2000,
        }
    }
}

impl ChunkingConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size cannot be 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::config("chunk_overlap must be smaller than chunk_size"));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(Error::config("min_chunk_size cannot exceed chunk_size"));
        }
        if self.max_chunk_size < self.chunk_size {
            return Err(Error::config("max_chunk_size cannot be below chunk_size"));
        }
        Ok(())
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint.
    Openai,
    /// Local feature hashing; no network.
    Hash,
}

/// Embedding settings.
#[derive(Clone)]
pub struct EmbeddingConfig {
    /// Backend.
    pub provider: EmbeddingProvider,
    /// Model name sent to the provider.
    pub model: String,
    /// Vector length.
    pub dimensions: usize,
    /// Texts per request.
    pub batch_size: usize,
    /// Retries for transient failures.
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// API base URL.
    pub api_base: String,
    /// API key, if the provider needs one.
    pub api_key: Option<String>,
    /// Model context limit in tokens.
    pub max_tokens: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Openai,
            model: "text-embedding-3-large".to_string(),
            dimensions: 3072,
            batch_size: 100,
            max_retries: 3,
            timeout_secs: 60,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            max_tokens: 8191,
        }
    }
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("timeout_secs", &self.timeout_secs)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl EmbeddingConfig {
    /// Offline hash embeddings of the given width.
    #[must_use]
    pub fn hash(dimensions: usize) -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            model: format!("hash-{dimensions}"),
            dimensions,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(Error::config("embedding dimensions cannot be 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("embedding batch_size cannot be 0"));
        }
        if self.model.is_empty() {
            return Err(Error::config("embedding model cannot be empty"));
        }
        Ok(())
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.watcher.debounce_ms, 50);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.indexer.max_concurrent_files, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_port() {
        let mut config = Config::default();
        config.server.port = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_validate_empty_host() {
        let mut config = Config::default();
        config.server.host = String::new();
        assert!(config.validate().unwrap_err().to_string().contains("host"));
    }

    #[test]
    fn test_log_level_case_insensitive() {
        for level in ["TRACE", "Debug", "INFO", "Warn", "ERROR"] {
            let config = Config {
                log_level: level.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "Level '{level}' should be valid");
        }
        let config = Config {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("log level"));
    }

    #[test]
    fn test_chunking_rules() {
        let mut config = Config::default();
        config.chunking.chunk_overlap = 1000;
        assert!(config.validate().unwrap_err().to_string().contains("chunk_overlap"));

        let mut config = Config::default();
        config.chunking.min_chunk_size = 1001;
        assert!(config.validate().unwrap_err().to_string().contains("min_chunk_size"));

        let mut config = Config::default();
        config.chunking.max_chunk_size = 999;
        assert!(config.validate().unwrap_err().to_string().contains("max_chunk_size"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = Config::default();
        config.embedding.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.dimensions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.indexer.max_concurrent_files = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watcher.move_correlation_ms = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("move_correlation_ms"));
    }

    #[test]
    fn test_bad_ignore_pattern_rejected() {
        let mut config = Config::default();
        config.watcher.ignore_patterns.push("[".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/docmirror"),
            ..Default::default()
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/docmirror/docmirror.db")
        );
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let config = EmbeddingConfig {
            api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
