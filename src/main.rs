//! docmirror - semantic mirror of watched document folders
//!
//! Entry point: starts the watcher, the indexer and the HTTP API.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use docmirror::config::{EmbeddingConfig, EmbeddingProvider};
use docmirror::embeddings::create_embedder;
use docmirror::indexer::IndexerProcess;
use docmirror::server::{init_metrics, init_tracing, App};
use docmirror::storage::{init_storage, Database};
use docmirror::watcher::WatcherProcess;
use docmirror::Config;

/// docmirror - semantic mirror of watched document folders
#[derive(Parser, Debug)]
#[command(name = "docmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory for the `SQLite` database
    #[arg(short, long, env = "DOCMIRROR_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Host address to bind to
    #[arg(long, env = "DOCMIRROR_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "DOCMIRROR_PORT", default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DOCMIRROR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "DOCMIRROR_LOG_JSON")]
    log_json: bool,

    /// Folders to register as roots at startup
    #[arg(short, long, env = "DOCMIRROR_WATCH_DIRS", value_delimiter = ',')]
    watch: Vec<PathBuf>,

    /// Embedding provider
    #[arg(long, env = "DOCMIRROR_EMBEDDING_PROVIDER", value_enum, default_value = "openai")]
    embedding_provider: EmbeddingProvider,

    /// Embedding model name
    #[arg(long, env = "DOCMIRROR_EMBEDDING_MODEL", default_value = "text-embedding-3-large")]
    embedding_model: String,

    /// Embedding vector dimensions
    #[arg(long, env = "DOCMIRROR_EMBEDDING_DIMENSIONS", default_value = "3072")]
    embedding_dimensions: usize,

    /// Base URL of the OpenAI-compatible embeddings API
    #[arg(long, env = "DOCMIRROR_EMBEDDING_API_BASE", default_value = "https://api.openai.com/v1")]
    embedding_api_base: String,

    /// API key for the embeddings API
    #[arg(long, env = "DOCMIRROR_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Texts per embedding request
    #[arg(long, env = "DOCMIRROR_EMBEDDING_BATCH_SIZE", default_value = "100")]
    embedding_batch_size: usize,

    /// Target chunk size in characters
    #[arg(long, env = "DOCMIRROR_CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    /// Characters shared between consecutive chunks
    #[arg(long, env = "DOCMIRROR_CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    /// Watcher debounce window in milliseconds
    #[arg(long, env = "DOCMIRROR_DEBOUNCE_MS", default_value = "50")]
    debounce_ms: u64,

    /// Move correlation window in milliseconds
    #[arg(long, env = "DOCMIRROR_MOVE_CORRELATION_MS", default_value = "100")]
    move_correlation_ms: u64,

    /// Extra ignore patterns (gitignore syntax), added to the defaults
    #[arg(long, env = "DOCMIRROR_IGNORE", value_delimiter = ',')]
    ignore: Vec<String>,

    /// Files indexed concurrently
    #[arg(long, env = "DOCMIRROR_MAX_CONCURRENT_FILES", default_value = "4")]
    max_concurrent_files: usize,

    /// Seconds before a failed file is retried
    #[arg(long, env = "DOCMIRROR_RETRY_FAILED_AFTER", default_value = "300")]
    retry_failed_after: u64,

    /// Skip the resync of all roots at startup
    #[arg(long, env = "DOCMIRROR_NO_RESYNC")]
    no_resync: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config {
            data_dir: self.data_dir,
            log_level: self.log_level,
            log_json: self.log_json,
            initial_roots: self.watch,
            ..Config::default()
        };

        config.server.host = self.host;
        config.server.port = self.port;

        config.watcher.debounce_ms = self.debounce_ms;
        config.watcher.move_correlation_ms = self.move_correlation_ms;
        config.watcher.ignore_patterns.extend(self.ignore);

        config.indexer.max_concurrent_files = self.max_concurrent_files;
        config.indexer.retry_failed_after_seconds = self.retry_failed_after;
        config.indexer.resync_on_start = !self.no_resync;

        config.chunking.chunk_size = self.chunk_size;
        config.chunking.chunk_overlap = self.chunk_overlap;
        config.chunking.max_chunk_size = config.chunking.max_chunk_size.max(self.chunk_size);
        config.chunking.min_chunk_size = config.chunking.min_chunk_size.min(self.chunk_size);

        config.embedding = match self.embedding_provider {
            EmbeddingProvider::Hash => EmbeddingConfig::hash(self.embedding_dimensions),
            EmbeddingProvider::Openai => EmbeddingConfig {
                model: self.embedding_model,
                dimensions: self.embedding_dimensions,
                api_base: self.embedding_api_base,
                api_key: self.embedding_api_key,
                ..EmbeddingConfig::default()
            },
        };
        config.embedding.batch_size = self.embedding_batch_size;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_json);

    tracing::info!("docmirror v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config();
    tracing::debug!(?config, "Configuration loaded");
    config.validate().context("invalid configuration")?;

    let db_path = config.database_path();
    tracing::info!(
        "Server will bind to {}, data in {}",
        config.server.addr(),
        db_path.display()
    );

    // Watcher and indexer each get their own connection to the same file.
    let indexer_db = Database::open_or_recover(&db_path)
        .with_context(|| format!("cannot open database {}", db_path.display()))?;
    init_storage(&indexer_db).context("cannot migrate database")?;
    let watcher_db = Database::open(&db_path).context("cannot open watcher connection")?;

    init_metrics();

    let embedder = create_embedder(&config.embedding).context("cannot create embedding provider")?;
    let watcher = WatcherProcess::new(watcher_db, config.watcher.clone())?;
    let indexer = Arc::new(IndexerProcess::new(indexer_db, &config, embedder)?);

    for root in &config.initial_roots {
        match indexer.add_root(root).await {
            Ok(true) => tracing::info!(root = %root.display(), "Registered root from command line"),
            Ok(false) => tracing::debug!(root = %root.display(), "Root already registered"),
            Err(e) => tracing::warn!(root = %root.display(), error = %e, "Cannot register root"),
        }
    }

    watcher.start_async().context("cannot start watcher")?;
    indexer.start_async().context("cannot start indexer")?;

    let served = App::new(config.server.clone(), Arc::clone(&indexer)).run().await;

    if let Err(e) = indexer.stop().await {
        tracing::warn!(error = %e, "Indexer stop failed");
    }
    if let Err(e) = watcher.stop().await {
        tracing::warn!(error = %e, "Watcher stop failed");
    }
    tracing::info!("docmirror stopped");

    served.map_err(Into::into)
}
