//! REST API endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::metrics::render;
use crate::indexer::{IndexerProcess, IntegrityReport, ResyncReport};
use crate::storage::SearchOptions;

type ApiResult<T> = std::result::Result<T, ApiError>;
type AppState = Arc<IndexerProcess>;

const MAX_TOP_K: usize = 100;
const MAX_PAGE: usize = 1000;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub indexer: crate::indexer::IndexerState,
}

/// Body of `POST /api/v1/roots`.
#[derive(Debug, Deserialize)]
pub struct AddRootRequest {
    pub path: PathBuf,
}

/// Body of `PATCH /api/v1/roots`.
#[derive(Debug, Deserialize)]
pub struct UpdateRootRequest {
    pub path: PathBuf,
    pub enabled: bool,
}

/// Query of `DELETE /api/v1/roots` and `GET /api/v1/documents/chunks`.
#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

/// Body of the search endpoints. Options are inlined next to `query`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

/// Body of `POST /api/v1/context`.
#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

const fn default_max_chunks() -> usize {
    5
}

const fn default_max_chars() -> usize {
    8000
}

/// Query of `GET /api/v1/documents`.
#[derive(Debug, Deserialize)]
pub struct DocumentsQuery {
    pub under: Option<String>,
    #[serde(default = "default_page")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// Query of `GET /api/v1/activity`.
#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default = "default_page")]
    pub limit: usize,
}

const fn default_page() -> usize {
    50
}

/// Create REST API router.
pub fn create_rest_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route(
            "/api/v1/roots",
            get(list_roots).post(add_root).patch(update_root).delete(remove_root),
        )
        .route("/api/v1/resync", post(resync))
        .route("/api/v1/integrity", post(integrity))
        .route("/api/v1/search", post(search))
        .route("/api/v1/search/keyword", post(keyword_search))
        .route("/api/v1/search/documents", post(search_documents))
        .route("/api/v1/context", post(context))
        .route("/api/v1/documents", get(list_documents))
        .route("/api/v1/documents/chunks", get(document_chunks))
        .route("/api/v1/failures", get(failures))
        .route("/api/v1/activity", get(activity))
        .with_state(state)
}

fn check_page(limit: usize) -> ApiResult<usize> {
    if limit == 0 || limit > MAX_PAGE {
        return Err(ApiError::invalid(format!("limit must be between 1 and {MAX_PAGE}")));
    }
    Ok(limit)
}

fn check_search(request: &SearchRequest) -> ApiResult<()> {
    if request.options.top_k == 0 || request.options.top_k > MAX_TOP_K {
        return Err(ApiError::invalid(format!("top_k must be between 1 and {MAX_TOP_K}")));
    }
    if !(0.0..=1.0).contains(&request.options.min_score) {
        return Err(ApiError::invalid("min_score must be between 0 and 1"));
    }
    Ok(())
}

/// Health check endpoint.
async fn health_check(State(indexer): State<AppState>) -> impl IntoResponse {
    let db_status = match indexer.database().health_check() {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            "error"
        }
    };

    let response = HealthResponse {
        status: if db_status == "ok" { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status.to_string(),
        indexer: indexer.state(),
    };
    let status_code = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    tracing::debug!(status = ?status_code, database = %db_status, "Health check");
    (status_code, Json(response))
}

/// Prometheus metrics endpoint.
async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(),
    )
}

async fn status(State(indexer): State<AppState>) -> ApiResult<impl IntoResponse> {
    let stats = indexer.stats()?;
    tracing::debug!(documents = stats.store.documents, chunks = stats.store.chunks, "Status retrieved");
    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "stats": stats,
    })))
}

async fn list_roots(State(indexer): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(serde_json::json!({ "roots": indexer.list_roots()? })))
}

async fn add_root(
    State(indexer): State<AppState>,
    Json(request): Json<AddRootRequest>,
) -> ApiResult<impl IntoResponse> {
    let added = indexer.add_root(&request.path).await?;
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(serde_json::json!({ "path": request.path, "added": added })),
    ))
}

async fn update_root(
    State(indexer): State<AppState>,
    Json(request): Json<UpdateRootRequest>,
) -> ApiResult<impl IntoResponse> {
    indexer.set_root_enabled(&request.path, request.enabled).await?;
    Ok(Json(serde_json::json!({ "path": request.path, "enabled": request.enabled })))
}

async fn remove_root(
    State(indexer): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    let documents = indexer.remove_root(std::path::Path::new(&query.path)).await?;
    Ok(Json(serde_json::json!({ "path": query.path, "documents_removed": documents })))
}

/// Long-running maintenance runs on its own task so a request timeout
/// does not abandon it halfway.
async fn resync(State(indexer): State<AppState>) -> ApiResult<Json<ResyncReport>> {
    let report = tokio::spawn(async move { indexer.resync().await })
        .await
        .map_err(|e| crate::Error::internal(format!("resync task failed: {e}")))??;
    Ok(Json(report))
}

async fn integrity(State(indexer): State<AppState>) -> ApiResult<Json<IntegrityReport>> {
    let report = tokio::spawn(async move { indexer.integrity_check().await })
        .await
        .map_err(|e| crate::Error::internal(format!("integrity task failed: {e}")))??;
    Ok(Json(report))
}

async fn search(
    State(indexer): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    check_search(&request)?;
    let results = indexer.search(&request.query, request.options).await?;
    tracing::debug!(query = %request.query, results = results.len(), "Search");
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn keyword_search(
    State(indexer): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    check_search(&request)?;
    let results = indexer.keyword_search(&request.query, request.options)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn search_documents(
    State(indexer): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<impl IntoResponse> {
    check_search(&request)?;
    let results = indexer.search_documents(&request.query, request.options).await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn context(
    State(indexer): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.max_chunks == 0 || request.max_chunks > MAX_TOP_K {
        return Err(ApiError::invalid(format!("max_chunks must be between 1 and {MAX_TOP_K}")));
    }
    let context = indexer
        .get_context_for_query(&request.query, request.max_chunks, request.max_chars)
        .await?;
    Ok(Json(serde_json::json!({ "context": context })))
}

async fn list_documents(
    State(indexer): State<AppState>,
    Query(query): Query<DocumentsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = check_page(query.limit)?;
    let documents = indexer.list_documents(query.under.as_deref(), limit, query.offset)?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

async fn document_chunks(
    State(indexer): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<impl IntoResponse> {
    if indexer.store().get_document(&query.path)?.is_none() {
        return Err(crate::Error::from(crate::error::StorageError::not_found("document", query.path)).into());
    }
    Ok(Json(serde_json::json!({ "chunks": indexer.chunks_for(&query.path)? })))
}

async fn failures(State(indexer): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(serde_json::json!({ "failures": indexer.failures()? })))
}

async fn activity(
    State(indexer): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = check_page(query.limit)?;
    Ok(Json(serde_json::json!({ "activity": indexer.activity(limit)? })))
}
