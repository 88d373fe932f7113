//! Prometheus metrics definitions.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Documents in the store.
pub static DOCUMENTS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("docmirror_documents_total", "Number of indexed documents").unwrap()
});

/// Chunks in the store.
pub static CHUNKS_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("docmirror_chunks_total", "Number of indexed chunks").unwrap()
});

/// File events waiting for the indexer.
pub static EVENT_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "docmirror_event_queue_depth",
        "File events waiting to be indexed"
    )
    .unwrap()
});

/// Commands waiting for the watcher.
pub static COMMAND_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "docmirror_command_queue_depth",
        "Commands waiting for the watcher"
    )
    .unwrap()
});

/// File events applied, by kind.
pub static EVENTS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docmirror_events_processed_total",
        "File events applied by the indexer",
        &["kind"]
    )
    .unwrap()
});

/// Files that failed to index.
pub static INDEX_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("docmirror_index_failures_total", "Files that failed to index").unwrap()
});

/// Embedding requests retried after a transient failure.
pub static EMBEDDING_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "docmirror_embedding_retries_total",
        "Embedding requests retried after a transient failure"
    )
    .unwrap()
});

/// Request latency histogram.
pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "docmirror_request_duration_seconds",
        "Request latency in seconds",
        &["endpoint", "method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .unwrap()
});

/// Request counter.
pub static REQUEST_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "docmirror_requests_total",
        "Total number of requests",
        &["endpoint", "method", "status"]
    )
    .unwrap()
});

/// Initialize all metrics (call once at startup).
pub fn init_metrics() {
    let _ = &*DOCUMENTS_TOTAL;
    let _ = &*CHUNKS_TOTAL;
    let _ = &*EVENT_QUEUE_DEPTH;
    let _ = &*COMMAND_QUEUE_DEPTH;
    let _ = &*EVENTS_PROCESSED;
    let _ = &*INDEX_FAILURES;
    let _ = &*EMBEDDING_RETRIES;
    let _ = &*REQUEST_LATENCY;
    let _ = &*REQUEST_COUNT;

    tracing::debug!("Prometheus metrics initialized");
}

/// Render the default registry in the text exposition format.
#[must_use]
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_render() {
        init_metrics();

        DOCUMENTS_TOTAL.set(3);
        assert_eq!(DOCUMENTS_TOTAL.get(), 3);
        EVENTS_PROCESSED.with_label_values(&["add"]).inc();

        let text = render();
        assert!(text.contains("docmirror_documents_total"));
        assert!(text.contains("docmirror_events_processed_total"));
    }
}
