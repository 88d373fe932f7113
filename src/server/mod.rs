//! HTTP surface.
//!
//! This module provides:
//! - REST API using axum, backed by an [`crate::indexer::IndexerProcess`]
//! - JSON error bodies mapped from [`crate::ErrorKind`]
//! - Health and Prometheus metrics endpoints
//! - Tracing subscriber setup

mod app;
mod error;
pub mod metrics;
mod observability;
mod rest;

pub use app::{shutdown_signal, App};
pub use error::ApiError;
pub use metrics::init_metrics;
pub use observability::init_tracing;
pub use rest::create_rest_router;
