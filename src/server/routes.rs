//! HTTP route handlers
//!
//! The v1 document surface, the analyzer surface and the GPU status surface,
//! all on one router. Pipeline-heavy handlers run in `spawn_blocking`; the
//! error taxonomy maps onto status codes through `ApiError`.

use super::state::AppState;
use crate::error::classify;
use crate::types::{
    BatchUpsertRequest, DeleteResponse, DocUpsertRequest, JobType, RebuildRequest, SearchRequest,
    UpsertResponse,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Error wrapper translating the taxonomy into HTTP responses
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = classify(&self.0);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({"detail": message}))).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // v1 document surface
        .route("/v1/docs/upsert", post(upsert_doc))
        .route("/v1/docs/upsert/batch", post(upsert_batch))
        .route("/v1/docs/:doc_id", delete(delete_doc))
        .route("/v1/index/rebuild", post(rebuild_index))
        .route("/v1/jobs/:job_id", get(get_job))
        .route("/v1/search", post(search))
        .route("/v1/health", get(health))
        .route("/v1/index/stats", get(index_stats))
        .route("/v1/queue/stats", get(queue_stats))
        // analyzer surface
        .route("/analyze", post(analyze))
        .route("/analyze/parallel", post(analyze_parallel))
        .route("/analyze/async", post(analyze_async))
        .route("/analyze/async/parallel", post(analyze_async_parallel))
        .route("/analyze/status/:job_id", get(analyze_status))
        .route("/analyze/jobs", get(analyze_jobs))
        .route("/analyze/jobs/:job_id", delete(analyze_cancel))
        // GPU surface
        .route("/gpu/status", get(gpu_status))
        .route("/gpu/temperatures", get(gpu_temperatures))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Documents
// ============================================================================

async fn upsert_doc(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DocUpsertRequest>,
) -> ApiResult<Json<UpsertResponse>> {
    let coordinator = Arc::clone(&state.coordinator);
    let outcome = tokio::task::spawn_blocking(move || coordinator.upsert(&req))
        .await
        .map_err(anyhow::Error::from)??;

    Ok(Json(UpsertResponse {
        accepted: 1,
        upserted_docs: usize::from(!outcome.skipped),
        skipped_docs: usize::from(outcome.skipped),
        chunks_created: outcome.chunks_created,
        job_id: None,
    }))
}

async fn upsert_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchUpsertRequest>,
) -> ApiResult<Json<UpsertResponse>> {
    if req.async_mode {
        let payload = json!({"docs": req.docs});
        let job_id = state.queue.create(JobType::IngestDocs, payload)?;
        return Ok(Json(UpsertResponse {
            accepted: req.docs.len(),
            job_id: Some(job_id),
            ..Default::default()
        }));
    }

    let coordinator = Arc::clone(&state.coordinator);
    let response = tokio::task::spawn_blocking(move || coordinator.upsert_batch(&req.docs))
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct DeleteParams {
    tenant_id: String,
    namespace: String,
}

async fn delete_doc(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<DeleteResponse>> {
    let coordinator = Arc::clone(&state.coordinator);
    let tenant_id = params.tenant_id.clone();
    let namespace = params.namespace.clone();
    let deleted_doc_id = doc_id.clone();
    let chunks_deleted = tokio::task::spawn_blocking(move || {
        coordinator.delete_document(&tenant_id, &namespace, &deleted_doc_id)
    })
    .await
    .map_err(anyhow::Error::from)??;

    // Search filters deleted rows immediately; the rebuild catches the file up
    let job_id = state.queue.create(
        JobType::RebuildIndex,
        json!({
            "tenant_id": params.tenant_id,
            "namespace": params.namespace,
            "embedding_version": state.coordinator.embedding_version(),
            "reembed": false,
        }),
    )?;

    Ok(Json(DeleteResponse {
        deleted: true,
        chunks_deleted,
        job_id,
    }))
}

async fn rebuild_index(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RebuildRequest>,
) -> ApiResult<Json<Value>> {
    let job_id = state.queue.create(
        JobType::RebuildIndex,
        json!({
            "tenant_id": req.tenant_id,
            "namespace": req.namespace,
            "embedding_version": req.embedding_version,
            "reembed": req.reembed,
            "new_embedding_version": req.new_embedding_version,
        }),
    )?;
    Ok(Json(json!({"job_id": job_id})))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state
        .queue
        .get(&job_id)?
        .ok_or_else(|| crate::error::ServiceError::not_found(format!("job {} not found", job_id)))?;
    Ok(Json(serde_json::to_value(job).map_err(anyhow::Error::from)?))
}

// ============================================================================
// Search
// ============================================================================

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<crate::types::SearchResponse>> {
    let engine = Arc::clone(&state.search);
    let response = tokio::task::spawn_blocking(move || engine.search(&req))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(Json(response))
}

// ============================================================================
// Health & stats
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let db_ok = state.store.ping().is_ok();
    let index_dir_ok = state.settings.index_dir.exists();
    let queue_ok = state.queue.stats().is_ok();
    let healthy = db_ok && index_dir_ok && queue_ok;

    Ok(Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "checks": {
            "database": db_ok,
            "index_store": index_dir_ok,
            "queue": queue_ok,
        },
    })))
}

async fn index_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let metas = state.store.list_index_meta()?;
    let total_vectors: i64 = metas.iter().map(|m| m.ntotal).sum();
    let dirty: usize = metas.iter().filter(|m| m.dirty).count();
    Ok(Json(json!({
        "total_indices": metas.len(),
        "total_vectors": total_vectors,
        "dirty_indices": dirty,
        "indices": metas,
    })))
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let stats = state.queue.stats()?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

// ============================================================================
// Analyzer
// ============================================================================

#[derive(Deserialize)]
struct AnalyzeRequest {
    document: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

async fn run_analysis(
    state: Arc<AppState>,
    req: AnalyzeRequest,
    force_parallel: bool,
) -> ApiResult<Json<Value>> {
    let analyzer_jobs = state.analyzer_jobs.clone();
    // Run synchronously through the same analyzer the job service uses
    let result = tokio::task::spawn_blocking(move || {
        analyzer_jobs.analyzer().analyze(
            &req.document,
            req.filename.as_deref(),
            req.mime_type.as_deref(),
            None,
            force_parallel,
        )
    })
    .await
    .map_err(anyhow::Error::from)??;
    Ok(Json(serde_json::to_value(result).map_err(anyhow::Error::from)?))
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    run_analysis(state, req, false).await
}

async fn analyze_parallel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    run_analysis(state, req, true).await
}

async fn analyze_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    let job_id = state
        .analyzer_jobs
        .submit(req.document, req.filename, req.mime_type, false);
    Ok(Json(json!({"job_id": job_id, "status": "pending"})))
}

async fn analyze_async_parallel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    let job_id = state
        .analyzer_jobs
        .submit(req.document, req.filename, req.mime_type, true);
    Ok(Json(json!({"job_id": job_id, "status": "pending"})))
}

async fn analyze_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.analyzer_jobs.status(&job_id).ok_or_else(|| {
        crate::error::ServiceError::not_found(format!("analysis job {} not found", job_id))
    })?;
    Ok(Json(serde_json::to_value(job).map_err(anyhow::Error::from)?))
}

async fn analyze_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let jobs = state.analyzer_jobs.list();
    Ok(Json(json!({"jobs": jobs, "count": jobs.len()})))
}

async fn analyze_cancel(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.analyzer_jobs.cancel(&job_id) {
        return Err(crate::error::ServiceError::not_found(format!(
            "analysis job {} not found",
            job_id
        ))
        .into());
    }
    Ok(Json(json!({"cancelled": true})))
}

// ============================================================================
// GPU
// ============================================================================

async fn gpu_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.gpu.status())
}

async fn gpu_temperatures(State(state): State<Arc<AppState>>) -> Json<Value> {
    let temps = state.gpu.temperatures();
    Json(json!({"temperatures": temps}))
}
