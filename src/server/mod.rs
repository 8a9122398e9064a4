//! HTTP server module
//!
//! Wires the process-scoped services together: store, index manager, chunking
//! registry, embedder pool, GPU manager, job queue and worker, analyzer,
//! status reporter. Everything is constructed here at startup and passed by
//! `Arc`; nothing is ambient.

mod routes;
mod state;

pub use state::AppState;

use crate::analyzer::jobs::AnalyzerJobService;
use crate::analyzer::DocumentAnalyzer;
use crate::bm25::Bm25Index;
use crate::chunking::StrategyRegistry;
use crate::config::Settings;
use crate::embed::Encoder;
use crate::enrich::ContextEnricher;
use crate::gpu::GpuTaskManager;
use crate::index::IndexManager;
use crate::lock::PhaseLock;
use crate::parallel::ParallelEmbedder;
use crate::pipeline::rebuild::register_handlers;
use crate::pipeline::UpsertCoordinator;
use crate::queue::{JobQueue, JobWorker};
use crate::search::{RerankClient, SearchEngine};
use crate::status::StatusReporter;
use crate::store::Store;
use anyhow::{Context, Result};
use routes::create_router;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Build the shared application state from settings
pub fn build_state(settings: Settings) -> Result<Arc<AppState>> {
    let store = Store::open(&settings.database_path)?;
    let indexes = Arc::new(IndexManager::new(&settings.index_dir)?);
    let registry = Arc::new(StrategyRegistry::with_defaults());

    let gpu = Arc::new(GpuTaskManager::new(vec![
        settings.llm.model.clone(),
        settings.context.model.clone(),
    ]));

    let embedder = Arc::new(ParallelEmbedder::new(settings.embedding.clone(), Arc::clone(&gpu)));
    {
        let pool = Arc::clone(&embedder);
        gpu.set_framework_cleanup(Box::new(move || pool.unload_all()));
    }
    let encoder: Arc<dyn Encoder> = embedder;

    let enricher = Some(Arc::new(ContextEnricher::new(
        settings.context.clone(),
        settings.llm.clone(),
    )));

    let bm25 = match Bm25Index::open(&settings.index_dir) {
        Ok(index) => Some(Arc::new(index)),
        Err(err) => {
            warn!(error = %format!("{:#}", err), "BM25 index unavailable, hybrid search disabled");
            None
        }
    };

    let phase_lock = PhaseLock::new(&settings.phase_lock.path, settings.phase_lock.timeout_secs);
    let reporter = StatusReporter::start(&settings.webhook);

    let coordinator = Arc::new(UpsertCoordinator::new(
        store.clone(),
        Arc::clone(&indexes),
        Arc::clone(&registry),
        Arc::clone(&encoder),
        enricher,
        bm25.clone(),
        Arc::clone(&gpu),
        Some(phase_lock.clone()),
        reporter.clone(),
        settings.embedding.version.clone(),
    ));

    let reranker = settings
        .rerank
        .enabled
        .then(|| RerankClient::new(&settings.rerank.service_url));
    let search = Arc::new(SearchEngine::new(
        store.clone(),
        Arc::clone(&indexes),
        Arc::clone(&encoder),
        bm25,
        reranker,
        Arc::clone(&gpu),
        settings.fusion.clone(),
        settings.rerank.clone(),
        settings.embedding.version.clone(),
    ));

    let analyzer = Arc::new(DocumentAnalyzer::new(
        settings.analyzer.clone(),
        settings.llm.clone(),
        Arc::clone(&gpu),
        Some(phase_lock),
        reporter,
        settings.embedding.model_name.clone(),
    ));
    let analyzer_jobs = AnalyzerJobService::new(
        analyzer,
        Duration::from_secs(settings.analyzer.job_max_age_secs),
    );

    let queue = JobQueue::new(store.clone());

    Ok(Arc::new(AppState {
        settings,
        store,
        coordinator,
        search,
        queue,
        analyzer_jobs,
        gpu,
    }))
}

/// Spawn the background job worker on a dedicated thread
pub fn spawn_worker(state: &Arc<AppState>, poll_interval: Duration) {
    let mut worker = JobWorker::new(state.queue.clone(), poll_interval);
    register_handlers(&mut worker, Arc::clone(&state.coordinator), state.queue.clone());
    std::thread::Builder::new()
        .name("job-worker".to_string())
        .spawn(move || worker.run())
        .expect("failed to spawn job worker thread");
}

/// Run the HTTP server with an in-process job worker
pub async fn run_server(settings: Settings, port: u16) -> Result<()> {
    // build_state constructs blocking HTTP clients; keep that off the async
    // worker threads
    let state = tokio::task::spawn_blocking(move || build_state(settings)).await??;
    spawn_worker(&state, Duration::from_secs(1));

    let app = create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;

    info!(port, "server listening");
    info!("  POST   /v1/docs/upsert          - Upsert one document");
    info!("  POST   /v1/docs/upsert/batch    - Batch upsert (sync or async)");
    info!("  DELETE /v1/docs/:doc_id         - Soft-delete + rebuild");
    info!("  POST   /v1/index/rebuild        - Enqueue index rebuild");
    info!("  GET    /v1/jobs/:job_id         - Job status");
    info!("  POST   /v1/search               - Dense/hybrid search");
    info!("  GET    /v1/health               - Readiness");
    info!("  GET    /v1/index/stats          - Per-index metadata");
    info!("  GET    /v1/queue/stats          - Queue counts");
    info!("  POST   /analyze[/parallel]      - Document analysis");
    info!("  POST   /analyze/async[/...]     - Async analysis jobs");
    info!("  GET    /gpu/status              - Device inventory");

    axum::serve(listener, app).await?;
    Ok(())
}
