//! Deterministic offline embeddings.
//!
//! Feature hashing over lowercase word tokens: each token lands in one
//! dimension chosen by its `blake3` digest, with a sign bit from the same
//! digest, and the result is L2-normalised. Texts sharing words score high
//! under cosine similarity, which is enough for local use and tests.

use async_trait::async_trait;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::storage::normalize;
use crate::Result;

/// Bag-of-words feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model_id: String,
    dimensions: usize,
    batch_size: usize,
    max_tokens: usize,
}

impl HashEmbedder {
    /// Embedder of the given width.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            model_id: format!("hash-{dimensions}"),
            dimensions,
            batch_size: 100,
            max_tokens: 8191,
        }
    }

    /// Build from configuration (model name, width and batch size).
    #[must_use]
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            model_id: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size,
            max_tokens: config.max_tokens,
        }
    }

    /// Override the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Embed one text synchronously.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dimensions];
        if self.dimensions == 0 {
            return v;
        }
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        for token in tokens {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut slot = [0_u8; 8];
            slot.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(slot) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[index] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}
