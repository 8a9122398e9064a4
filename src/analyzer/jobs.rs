//! Async analysis jobs
//!
//! In-memory job tracking for document analysis submitted over HTTP. Work
//! runs on a background thread; terminal jobs older than the configured age
//! are garbage collected on access. Cancellation only deletes the record,
//! running work is not preempted.

use super::DocumentAnalyzer;
use crate::types::DocumentAnalysis;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Analysis job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

/// One tracked analysis job
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub job_id: String,
    pub status: AnalysisStatus,
    pub progress_pct: u8,
    pub message: String,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DocumentAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type JobMap = Arc<Mutex<HashMap<String, AnalysisJob>>>;

/// Submit/status/list/cancel surface over the analyzer
#[derive(Clone)]
pub struct AnalyzerJobService {
    analyzer: Arc<DocumentAnalyzer>,
    jobs: JobMap,
    max_age: Duration,
}

impl AnalyzerJobService {
    pub fn new(analyzer: Arc<DocumentAnalyzer>, max_age: Duration) -> Self {
        Self {
            analyzer,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            max_age,
        }
    }

    pub fn analyzer(&self) -> Arc<DocumentAnalyzer> {
        Arc::clone(&self.analyzer)
    }

    /// Queue a document for analysis; work starts immediately on a
    /// background thread
    pub fn submit(
        &self,
        document: String,
        filename: Option<String>,
        mime_type: Option<String>,
        force_parallel: bool,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(
                job_id.clone(),
                AnalysisJob {
                    job_id: job_id.clone(),
                    status: AnalysisStatus::Pending,
                    progress_pct: 0,
                    message: "queued".to_string(),
                    filename: filename.clone(),
                    created_at: now,
                    updated_at: now,
                    result: None,
                    error: None,
                },
            );
        }

        let analyzer = Arc::clone(&self.analyzer);
        let jobs = Arc::clone(&self.jobs);
        let worker_job_id = job_id.clone();
        std::thread::spawn(move || {
            set_state(&jobs, &worker_job_id, |job| {
                job.status = AnalysisStatus::Processing;
                job.progress_pct = 10;
                job.message = "analyzing".to_string();
            });

            let result = analyzer.analyze(
                &document,
                filename.as_deref(),
                mime_type.as_deref(),
                Some(&worker_job_id),
                force_parallel,
            );

            match result {
                Ok(analysis) => set_state(&jobs, &worker_job_id, |job| {
                    job.status = AnalysisStatus::Completed;
                    job.progress_pct = 100;
                    job.message = "completed".to_string();
                    job.result = Some(analysis.clone());
                }),
                Err(err) => {
                    warn!(job_id = %worker_job_id, error = %format!("{:#}", err), "analysis job failed");
                    let msg = format!("{:#}", err);
                    set_state(&jobs, &worker_job_id, |job| {
                        job.status = AnalysisStatus::Failed;
                        job.message = "failed".to_string();
                        job.error = Some(msg.clone());
                    });
                }
            }
        });

        info!(job_id = %job_id, "analysis job submitted");
        job_id
    }

    pub fn status(&self, job_id: &str) -> Option<AnalysisJob> {
        self.gc();
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn list(&self) -> Vec<AnalysisJob> {
        self.gc();
        let mut jobs: Vec<AnalysisJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Delete the record; running work keeps going but its result is dropped
    pub fn cancel(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().remove(job_id).is_some()
    }

    /// Drop terminal jobs older than the configured maximum age
    fn gc(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.max_age).unwrap_or_default();
        let mut jobs = self.jobs.lock().unwrap();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
    }
}

fn set_state(jobs: &JobMap, job_id: &str, f: impl FnOnce(&mut AnalysisJob)) {
    let mut jobs = jobs.lock().unwrap();
    if let Some(job) = jobs.get_mut(job_id) {
        f(job);
        job.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerSettings, LlmSettings};
    use crate::gpu::GpuTaskManager;
    use crate::status::StatusReporter;

    fn service(max_age: Duration) -> AnalyzerJobService {
        // Analyzer pointed at an unreachable endpoint: jobs complete with an
        // aggregated (error-annotated) result rather than hanging
        let llm = LlmSettings {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            ..Default::default()
        };
        let analyzer = DocumentAnalyzer::new(
            AnalyzerSettings::default(),
            llm,
            std::sync::Arc::new(GpuTaskManager::new(vec![])),
            None,
            StatusReporter::disabled(),
            "BAAI/bge-m3".to_string(),
        );
        AnalyzerJobService::new(Arc::new(analyzer), max_age)
    }

    fn wait_terminal(service: &AnalyzerJobService, job_id: &str) -> AnalysisJob {
        for _ in 0..200 {
            if let Some(job) = service.status(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("job never reached a terminal state");
    }

    #[test]
    fn test_submit_and_complete() {
        let service = service(Duration::from_secs(3600));
        let job_id = service.submit("small document".to_string(), Some("a.txt".to_string()), None, false);

        let job = wait_terminal(&service, &job_id);
        // LLM unreachable: batches fail but aggregation still completes
        assert_eq!(job.status, AnalysisStatus::Completed);
        let analysis = job.result.unwrap();
        assert_eq!(analysis.extra["batches_processed"], 0);
        assert_eq!(analysis.extra["batches_failed"], 1);
    }

    #[test]
    fn test_cancel_removes_record() {
        let service = service(Duration::from_secs(3600));
        let job_id = service.submit("doc".to_string(), None, None, false);
        assert!(service.cancel(&job_id));
        assert!(service.status(&job_id).is_none());
        assert!(!service.cancel(&job_id));
    }

    #[test]
    fn test_gc_drops_old_terminal_jobs() {
        let service = service(Duration::from_millis(1));
        let job_id = service.submit("doc".to_string(), None, None, false);

        // The job completes quickly (unreachable endpoint) and the short max
        // age then removes it on a later status access
        for _ in 0..200 {
            if service.status(&job_id).is_none() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("terminal job was never garbage collected");
    }

    #[test]
    fn test_list_sorted_newest_first() {
        let service = service(Duration::from_secs(3600));
        let first = service.submit("doc one".to_string(), None, None, false);
        std::thread::sleep(Duration::from_millis(20));
        let second = service.submit("doc two".to_string(), None, None, false);

        wait_terminal(&service, &first);
        wait_terminal(&service, &second);

        let jobs = service.list();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, second);
    }
}
