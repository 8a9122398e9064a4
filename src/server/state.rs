//! Server application state

use crate::analyzer::jobs::AnalyzerJobService;
use crate::config::Settings;
use crate::gpu::GpuTaskManager;
use crate::pipeline::UpsertCoordinator;
use crate::queue::JobQueue;
use crate::search::SearchEngine;
use crate::store::Store;
use std::sync::Arc;

/// Shared application state for all route handlers
pub struct AppState {
    pub settings: Settings,
    pub store: Store,
    pub coordinator: Arc<UpsertCoordinator>,
    pub search: Arc<SearchEngine>,
    pub queue: JobQueue,
    pub analyzer_jobs: AnalyzerJobService,
    pub gpu: Arc<GpuTaskManager>,
}
