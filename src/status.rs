//! Status reporter
//!
//! Emits stage-transition webhooks for document processing. `emit` never
//! blocks the pipeline: updates go into a bounded channel drained by one
//! dedicated sender task with a shared HTTP client; on overflow the update is
//! dropped with a log line, and delivery failures are always swallowed.

use crate::config::WebhookSettings;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error as log_error, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Document processing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Queued,
    Analyzing,
    Chunking,
    Enriching,
    Embedding,
    Storing,
    Reranking,
    Searching,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Queued => "queued",
            Stage::Analyzing => "analyzing",
            Stage::Chunking => "chunking",
            Stage::Enriching => "enriching",
            Stage::Embedding => "embedding",
            Stage::Storing => "storing",
            Stage::Reranking => "reranking",
            Stage::Searching => "searching",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

/// One status update
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub source: &'static str,
    pub timestamp: String,
    pub doc_id: String,
    pub stage: Stage,
    pub progress_pct: Option<u8>,
    pub message: Option<String>,
    pub metadata: Value,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(doc_id: &str, stage: Stage) -> Self {
        Self {
            source: "silo",
            timestamp: Utc::now().to_rfc3339(),
            doc_id: doc_id.to_string(),
            stage,
            progress_pct: None,
            message: None,
            metadata: json!({}),
            error: None,
        }
    }

    pub fn progress(mut self, pct: u8) -> Self {
        self.progress_pct = Some(pct.min(100));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Enrichment progress maps to 30-50%
pub fn enriching_pct(done: usize, total: usize) -> u8 {
    (30 + done * 20 / total.max(1)) as u8
}

/// Embedding progress maps to 50-80%
pub fn embedding_pct(done: usize, total: usize) -> u8 {
    (50 + done * 30 / total.max(1)) as u8
}

/// Fire-and-forget webhook emitter
#[derive(Clone)]
pub struct StatusReporter {
    tx: Option<mpsc::Sender<StatusUpdate>>,
}

impl StatusReporter {
    /// Start the reporter: spawns the sender task on the current runtime.
    /// With webhooks disabled or unconfigured every emit is a no-op.
    pub fn start(settings: &WebhookSettings) -> Self {
        if !settings.enabled || settings.url.is_empty() {
            info!("status webhooks disabled");
            return Self { tx: None };
        }

        let (tx, mut rx) = mpsc::channel::<StatusUpdate>(CHANNEL_CAPACITY);
        let url = settings.url.clone();
        let secret = settings.secret.clone();
        let timeout = Duration::from_secs_f64(settings.timeout_secs.max(0.1));

        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(client) => client,
                Err(err) => {
                    log_error!(error = %err, "failed to build webhook client, reporter stopped");
                    return;
                }
            };

            while let Some(update) = rx.recv().await {
                let mut request = client
                    .post(&url)
                    .header("X-Source", "silo-pipeline")
                    .json(&update);
                if !secret.is_empty() {
                    request = request.header("X-Webhook-Secret", &secret);
                }

                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(doc_id = %update.doc_id, stage = update.stage.as_str(), "webhook sent");
                    }
                    Ok(resp) => {
                        warn!(status = %resp.status(), "webhook rejected");
                    }
                    Err(err) => {
                        warn!(error = %err, "webhook delivery failed");
                    }
                }
            }
        });

        info!(url = %settings.url, "status reporter started");
        Self { tx: Some(tx) }
    }

    /// A reporter that drops everything (tests, disabled deployments)
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Non-blocking emit; drops the update when the channel is full
    pub fn emit(&self, update: StatusUpdate) {
        if let Some(tx) = &self.tx {
            if update.stage == Stage::Failed {
                log_error!(doc_id = %update.doc_id, error = update.error.as_deref().unwrap_or(""), "stage failed");
            } else {
                debug!(
                    doc_id = %update.doc_id,
                    stage = update.stage.as_str(),
                    progress = update.progress_pct.unwrap_or(0),
                    "status update"
                );
            }
            if let Err(mpsc::error::TrySendError::Full(update)) = tx.try_send(update) {
                warn!(doc_id = %update.doc_id, "status channel full, dropping update");
            }
        }
    }

    // Stage shorthands with their canonical progress percentages

    pub fn received(&self, doc_id: &str, filename: Option<&str>) {
        let mut metadata = json!({});
        if let Some(filename) = filename {
            metadata = json!({"filename": filename});
        }
        self.emit(
            StatusUpdate::new(doc_id, Stage::Received)
                .progress(0)
                .message(format!("Document received: {}", filename.unwrap_or(doc_id)))
                .metadata(metadata),
        );
    }

    pub fn chunking(&self, doc_id: &str, strategy: Option<&str>) {
        self.emit(
            StatusUpdate::new(doc_id, Stage::Chunking)
                .progress(25)
                .message(format!("Chunking with strategy: {}", strategy.unwrap_or("auto")))
                .metadata(json!({"chunk_strategy": strategy})),
        );
    }

    pub fn enriching(&self, doc_id: &str, done: usize, total: usize) {
        self.emit(
            StatusUpdate::new(doc_id, Stage::Enriching)
                .progress(enriching_pct(done, total))
                .message(format!("Enriching chunk {}/{}", done, total))
                .metadata(json!({"chunks_total": total, "chunks_done": done})),
        );
    }

    pub fn embedding(&self, doc_id: &str, done: usize, total: usize, model: &str) {
        self.emit(
            StatusUpdate::new(doc_id, Stage::Embedding)
                .progress(embedding_pct(done, total))
                .message(format!("Embedding chunk {}/{}", done, total))
                .metadata(json!({"chunks_total": total, "chunks_done": done, "model": model})),
        );
    }

    pub fn storing(&self, doc_id: &str, chunk_count: usize) {
        self.emit(
            StatusUpdate::new(doc_id, Stage::Storing)
                .progress(85)
                .message(format!("Storing {} chunks in vector database", chunk_count))
                .metadata(json!({"chunks_count": chunk_count})),
        );
    }

    pub fn completed(&self, doc_id: &str, chunks_stored: usize) {
        self.emit(
            StatusUpdate::new(doc_id, Stage::Completed)
                .progress(100)
                .message(format!("Completed: {} chunks stored", chunks_stored))
                .metadata(json!({"chunks_stored": chunks_stored})),
        );
    }

    pub fn failed(&self, doc_id: &str, error: &str, stage: &str) {
        let preview: String = error.chars().take(100).collect();
        self.emit(
            StatusUpdate::new(doc_id, Stage::Failed)
                .message(format!("Failed at {}: {}", stage, preview))
                .error(error),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Received.as_str(), "received");
        assert_eq!(Stage::Enriching.as_str(), "enriching");
        assert_eq!(Stage::Failed.as_str(), "failed");
    }

    #[test]
    fn test_progress_ranges() {
        assert_eq!(enriching_pct(0, 10), 30);
        assert_eq!(enriching_pct(5, 10), 40);
        assert_eq!(enriching_pct(10, 10), 50);
        assert_eq!(embedding_pct(0, 10), 50);
        assert_eq!(embedding_pct(10, 10), 80);
        // Zero total never divides by zero
        assert_eq!(enriching_pct(0, 0), 30);
    }

    #[test]
    fn test_update_builder() {
        let update = StatusUpdate::new("d1", Stage::Embedding)
            .progress(250)
            .message("embedding")
            .metadata(json!({"model": "x"}))
            .error("oops");
        assert_eq!(update.doc_id, "d1");
        assert_eq!(update.progress_pct, Some(100), "progress clamps at 100");
        assert_eq!(update.metadata["model"], "x");
        assert_eq!(update.error.as_deref(), Some("oops"));
        assert_eq!(update.source, "silo");
    }

    #[test]
    fn test_disabled_reporter_is_noop() {
        let reporter = StatusReporter::disabled();
        // Must not panic or block without a runtime
        reporter.received("d1", Some("a.pdf"));
        reporter.chunking("d1", None);
        reporter.completed("d1", 3);
        reporter.failed("d1", "boom", "embedding");
    }

    #[test]
    fn test_payload_serialization_shape() {
        let update = StatusUpdate::new("d1", Stage::Storing).progress(85);
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["source"], "silo");
        assert_eq!(value["stage"], "storing");
        assert_eq!(value["progress_pct"], 85);
        assert!(value["timestamp"].is_string());
    }
}
