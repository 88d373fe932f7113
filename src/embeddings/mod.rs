//! Embedding providers.
//!
//! An [`Embedder`] turns text into fixed-width vectors. Providers implement a
//! single request ([`Embedder::embed_batch`]); batching and dimension checks
//! live in the provided [`Embedder::embed`].

mod hash;
mod http;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;

pub use hash::HashEmbedder;
pub use http::HttpEmbedder;
pub use retry::{backoff_delay, parse_retry_after, with_retry, Failure, RetryPolicy};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::EmbeddingError;
use crate::Result;

/// Rough token estimate used to decide whether a whole document fits the model.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A text embedding provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored next to every vector.
    fn model_id(&self) -> &str;

    /// Width of every returned vector.
    fn dimensions(&self) -> usize;

    /// Maximum texts per provider request.
    fn batch_size(&self) -> usize;

    /// Model context limit in tokens.
    fn max_tokens(&self) -> usize;

    /// Embed one batch in a single provider request.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed any number of texts, split into batches of [`Self::batch_size`].
    ///
    /// # Errors
    ///
    /// Fails on the first failing batch, or if a vector has the wrong width.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size().max(1)) {
            let embedded = self.embed_batch(batch).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingError::Rejected {
                    status: 0,
                    message: format!("expected {} vectors, got {}", batch.len(), embedded.len()),
                }
                .into());
            }
            for vector in &embedded {
                if vector.len() != self.dimensions() {
                    return Err(EmbeddingError::Dimensions {
                        expected: self.dimensions(),
                        actual: vector.len(),
                    }
                    .into());
                }
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns the provider error.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::Transient("empty embedding response".to_string()).into())
    }
}

/// Build the provider selected by `config`.
///
/// # Errors
///
/// Returns `EmbeddingError::Config` if the provider cannot be constructed,
/// for example when the HTTP provider has no API key.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Openai => Arc::new(HttpEmbedder::new(config)?),
        EmbeddingProvider::Hash => Arc::new(HashEmbedder::from_config(config)),
    };
    tracing::info!(
        model = embedder.model_id(),
        dimensions = embedder.dimensions(),
        "Embedding provider ready"
    );
    Ok(embedder)
}
