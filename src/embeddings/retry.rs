//! Exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::EmbeddingError;
use crate::server::metrics::EMBEDDING_RETRIES;
use crate::Result;

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// One failed attempt, with the server's `Retry-After` hint if any.
#[derive(Debug)]
pub struct Failure {
    /// What went wrong.
    pub error: EmbeddingError,
    /// Delay requested by the server.
    pub retry_after: Option<Duration>,
}

impl From<EmbeddingError> for Failure {
    fn from(error: EmbeddingError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// `base * 2^attempt` plus up to 25% jitter, capped at `max_delay`.
#[must_use]
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay
        .saturating_mul(1_u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(policy.max_delay);
    let jitter_ms = u64::try_from(capped.as_millis() / 4).unwrap_or(0);
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    (capped + jitter).min(policy.max_delay)
}

/// Parse a `Retry-After` value given in seconds.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
///
/// # Errors
///
/// Non-retryable errors are returned as-is after the first attempt; transient
/// ones become `RetriesExhausted` once `max_retries` retries have failed.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(failure) if !failure.error.is_retryable() => return Err(failure.error.into()),
            Err(failure) if attempt >= policy.max_retries => {
                return Err(EmbeddingError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: failure.error.to_string(),
                }
                .into());
            }
            Err(failure) => {
                let delay = failure
                    .retry_after
                    .map_or_else(|| backoff_delay(&policy, attempt), |d| d.min(policy.max_delay));
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure.error,
                    "Retrying after transient failure"
                );
                EMBEDDING_RETRIES.inc();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
