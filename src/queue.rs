//! Persistent job queue and worker loop
//!
//! Jobs survive restarts in the `jobs` table; `claim_next_pending` flips the
//! oldest pending job to running in one transaction, so several workers can
//! share a database without double-processing. Handlers are registered
//! explicitly at startup. A handler error marks the job failed with the
//! stringified error; operators resubmit, there are no automatic retries.

use crate::store::Store;
use crate::types::{Job, JobStatus, JobType, QueueStats};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Durable FIFO of typed jobs
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Enqueue a job; returns its id
    pub fn create(&self, job_type: JobType, payload: Value) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        self.store.create_job(&job_id, job_type, &payload)?;
        info!(job_id = %job_id, job_type = %job_type, "created job");
        Ok(job_id)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id)
    }

    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        self.store.update_job_status(job_id, status, progress, error)
    }

    /// Atomically claim the oldest pending job
    pub fn claim_next_pending(&self) -> Result<Option<Job>> {
        self.store.claim_next_pending()
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats()
    }
}

/// A job handler: gets the job id and payload, talks to its capabilities
/// through captured `Arc`s
pub type JobHandler = Arc<dyn Fn(&str, &Value) -> Result<()> + Send + Sync>;

/// Polling worker that dispatches jobs to registered handlers
pub struct JobWorker {
    queue: JobQueue,
    handlers: HashMap<JobType, JobHandler>,
    poll_interval: Duration,
}

impl JobWorker {
    pub fn new(queue: JobQueue, poll_interval: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            poll_interval,
        }
    }

    /// Register the handler for a job type (explicit, at startup)
    pub fn register(&mut self, job_type: JobType, handler: JobHandler) {
        info!(job_type = %job_type, "registered job handler");
        self.handlers.insert(job_type, handler);
    }

    /// Process at most one job. Returns whether a job was processed.
    pub fn run_once(&self) -> Result<bool> {
        let job = match self.queue.claim_next_pending()? {
            Some(job) => job,
            None => return Ok(false),
        };
        self.process(&job);
        Ok(true)
    }

    fn process(&self, job: &Job) {
        info!(job_id = %job.job_id, job_type = %job.job_type, "processing job");

        let handler = match self.handlers.get(&job.job_type) {
            Some(handler) => Arc::clone(handler),
            None => {
                let msg = format!("No handler registered for job type: {}", job.job_type);
                error!(job_id = %job.job_id, "{}", msg);
                let _ = self
                    .queue
                    .update_status(&job.job_id, JobStatus::Failed, None, Some(&msg));
                return;
            }
        };

        match handler(&job.job_id, &job.payload) {
            Ok(()) => {
                if let Err(err) =
                    self.queue
                        .update_status(&job.job_id, JobStatus::Completed, Some(100), None)
                {
                    warn!(job_id = %job.job_id, error = %err, "failed to mark job completed");
                }
                info!(job_id = %job.job_id, "job completed");
            }
            Err(err) => {
                let msg = format!("Job failed: {:#}", err);
                error!(job_id = %job.job_id, error = %msg, "job failed");
                if let Err(update_err) =
                    self.queue
                        .update_status(&job.job_id, JobStatus::Failed, None, Some(&msg))
                {
                    warn!(job_id = %job.job_id, error = %update_err, "failed to mark job failed");
                }
            }
        }
    }

    /// Blocking poll loop; run on a dedicated thread or in spawn_blocking.
    /// Worker errors are logged and the loop continues.
    pub fn run(&self) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "job worker started");
        loop {
            match self.run_once() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(self.poll_interval),
                Err(err) => {
                    error!(error = %err, "worker error");
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("jobs.db")).unwrap();
        (dir, JobQueue::new(store))
    }

    #[test]
    fn test_handler_success_completes_job() {
        let (_dir, queue) = queue();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut worker = JobWorker::new(queue.clone(), Duration::from_millis(10));
        let counter = Arc::clone(&calls);
        worker.register(
            JobType::RebuildIndex,
            Arc::new(move |_job_id, payload| {
                assert_eq!(payload["tenant_id"], "t1");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let job_id = queue
            .create(JobType::RebuildIndex, json!({"tenant_id": "t1"}))
            .unwrap();
        assert!(worker.run_once().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let job = queue.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_handler_error_fails_job_and_loop_continues() {
        let (_dir, queue) = queue();
        let mut worker = JobWorker::new(queue.clone(), Duration::from_millis(10));
        worker.register(
            JobType::IngestDocs,
            Arc::new(|_job_id, _payload| anyhow::bail!("synthetic failure")),
        );

        let failing = queue.create(JobType::IngestDocs, json!({})).unwrap();
        assert!(worker.run_once().unwrap());

        let job = queue.get(&failing).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("synthetic failure"));

        // The worker keeps polling after a failure
        assert!(!worker.run_once().unwrap());
    }

    #[test]
    fn test_missing_handler_fails_job() {
        let (_dir, queue) = queue();
        let worker = JobWorker::new(queue.clone(), Duration::from_millis(10));

        let job_id = queue.create(JobType::RebuildIndex, json!({})).unwrap();
        assert!(worker.run_once().unwrap());

        let job = queue.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("No handler registered"));
    }

    #[test]
    fn test_run_once_without_jobs() {
        let (_dir, queue) = queue();
        let worker = JobWorker::new(queue, Duration::from_millis(10));
        assert!(!worker.run_once().unwrap());
    }

    #[test]
    fn test_jobs_processed_in_order() {
        let (_dir, queue) = queue();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut worker = JobWorker::new(queue.clone(), Duration::from_millis(10));
        let sink = Arc::clone(&order);
        worker.register(
            JobType::IngestDocs,
            Arc::new(move |_job_id, payload| {
                sink.lock().unwrap().push(payload["n"].as_i64().unwrap());
                Ok(())
            }),
        );

        for n in 0..3 {
            queue.create(JobType::IngestDocs, json!({"n": n})).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        while worker.run_once().unwrap() {}

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
