//! OpenAI-compatible embeddings over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};

use super::retry::{parse_retry_after, with_retry, Failure, RetryPolicy};
use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::Result;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body).map_or_else(
        |_| body.chars().take(200).collect(),
        |parsed| parsed.error.message,
    )
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
    max_tokens: usize,
    policy: RetryPolicy,
}

impl HttpEmbedder {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::Config` without an API key or if the HTTP
    /// client cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EmbeddingError::Config("the OpenAI provider requires an API key".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EmbeddingError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/embeddings", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size,
            max_tokens: config.max_tokens,
            policy: RetryPolicy {
                max_retries: config.max_retries,
                ..RetryPolicy::default()
            },
        })
    }

    /// Replace the backoff policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn requested_dimensions(&self) -> Option<usize> {
        self.model
            .starts_with("text-embedding-3")
            .then_some(self.dimensions)
    }

    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, Failure> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions(),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Failure::from(EmbeddingError::Transient(format!("request failed: {e}"))))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let message = error_message(&response.text().await.unwrap_or_default());
            return Err(Failure {
                error: classify(status, message),
                retry_after,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Failure::from(EmbeddingError::Transient(format!("invalid response body: {e}"))))?;

        let mut items = parsed.data;
        items.sort_by_key(|item| item.index);
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

fn classify(status: StatusCode, message: String) -> EmbeddingError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EmbeddingError::Auth {
            status: code,
            message,
        },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            EmbeddingError::Transient(format!("{code}: {message}"))
        }
        s if s.is_server_error() => EmbeddingError::Transient(format!("{code}: {message}")),
        _ => EmbeddingError::Rejected {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
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
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(count = texts.len(), model = %self.model, "Requesting embeddings");
        with_retry(self.policy, "embeddings", || self.request(texts)).await
    }
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn embedder(server: &MockServer, batch_size: usize) -> HttpEmbedder {
        let config = EmbeddingConfig {
            model: "test-model".to_string(),
            dimensions: 3,
            batch_size,
            api_base: server.uri(),
            api_key: Some("sk-test".to_string()),
            ..EmbeddingConfig::default()
        };
        HttpEmbedder::new(&config).unwrap().with_retry_policy(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
    }

    fn ok_body(n: usize) -> serde_json::Value {
        // Reversed on purpose; the client must sort by index.
        let data: Vec<_> = (0..n)
            .rev()
            .map(|i| json!({ "index": i, "embedding": [i as f32, 0.0, 1.0] }))
            .collect();
        json!({ "data": data, "model": "test-model" })
    }

    #[tokio::test]
    async fn test_sorts_by_index_and_sends_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header_eq("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(3)))
            .expect(1)
            .mount(&server)
            .await;

        let texts: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();
        let vectors = embedder(&server, 10).embed(&texts).await.unwrap();
        assert_eq!(vectors[0][0], 0.0);
        assert_eq!(vectors[2][0], 2.0);
    }

    #[tokio::test]
    async fn test_batches_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(2)))
            .expect(3)
            .mount(&server)
            .await;

        let texts: Vec<String> = (0..6).map(|i| i.to_string()).collect();
        let vectors = embedder(&server, 2).embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 6);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(1)))
            .mount(&server)
            .await;

        let v = embedder(&server, 10).embed_single("hello").await.unwrap();
        assert_eq!(v.len(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({ "error": { "message": "invalid api key" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = embedder(&server, 10).embed_single("hello").await.unwrap_err();
        assert!(err.to_string().contains("invalid api key"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_request_is_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("too long"))
            .expect(1)
            .mount(&server)
            .await;

        let err = embedder(&server, 10).embed_single("hello").await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = embedder(&server, 10).embed_single("hello").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_wrong_width_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "index": 0, "embedding": [1.0] }]
            })))
            .mount(&server)
            .await;

        let err = embedder(&server, 10).embed_single("hello").await.unwrap_err();
        assert!(err.to_string().contains("expected 3 dimensions"));
    }

    #[test]
    fn test_dimensions_sent_only_for_v3_models() {
        let mut config = EmbeddingConfig {
            api_key: Some("k".to_string()),
            ..EmbeddingConfig::default()
        };
        assert_eq!(HttpEmbedder::new(&config).unwrap().requested_dimensions(), Some(3072));
        config.model = "nomic-embed-text".to_string();
        assert_eq!(HttpEmbedder::new(&config).unwrap().requested_dimensions(), None);
    }
}
