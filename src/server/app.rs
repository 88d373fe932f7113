//! Main application server.
//!
//! Provides the complete server application with signal handling
//! and graceful shutdown coordination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::metrics::{REQUEST_COUNT, REQUEST_LATENCY};
use super::rest::create_rest_router;
use crate::config::ServerConfig;
use crate::indexer::IndexerProcess;
use crate::Result;

/// Application server.
pub struct App {
    config: ServerConfig,
    indexer: Arc<IndexerProcess>,
}

async fn record_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    REQUEST_LATENCY
        .with_label_values(&[endpoint.as_str(), method.as_str()])
        .observe(start.elapsed().as_secs_f64());
    REQUEST_COUNT
        .with_label_values(&[endpoint.as_str(), method.as_str(), response.status().as_str()])
        .inc();
    response
}

async fn enforce_timeout(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(timeout = ?limit, "Request timed out");
            ApiError::timeout().into_response()
        }
    }
}

impl App {
    /// Create a new application serving `indexer`.
    #[must_use]
    pub fn new(config: ServerConfig, indexer: Arc<IndexerProcess>) -> Self {
        Self { config, indexer }
    }

    /// Build the router with all endpoints.
    pub(crate) fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        create_rest_router(Arc::clone(&self.indexer))
            .route_layer(middleware::from_fn(record_metrics))
            .layer(middleware::from_fn_with_state(
                self.config.request_timeout,
                enforce_timeout,
            ))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|request: &axum::http::Request<_>| {
                        let request_id = request
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("unknown");

                        tracing::info_span!(
                            "http_request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = %request_id,
                        )
                    })
                    .on_response(
                        |response: &Response, latency: Duration, _span: &tracing::Span| {
                            tracing::info!(
                                status = %response.status(),
                                latency_ms = latency.as_millis(),
                                "Request completed"
                            );
                        },
                    ),
            )
            .layer(cors)
    }

    /// Serve until Ctrl+C or SIGTERM, then drain open connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid, the port cannot be bound,
    /// or the server fails while running.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .addr()
            .parse()
            .map_err(|e| crate::Error::config(format!("invalid address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            crate::error::ServerError::BindFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(%addr, "Server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| crate::error::ServerError::Request(e.to_string()))?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Resolves on SIGTERM (Unix) or Ctrl+C.
///
/// If a handler cannot be installed that branch never fires; the other
/// signal still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
