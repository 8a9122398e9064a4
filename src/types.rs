use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document (metadata only; text lives in its chunks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub tenant_id: String,
    pub namespace: String,
    pub source: Option<String>,
    /// SHA-256 of the normalized text
    pub doc_hash: String,
    pub metadata: Value,
    pub policy_id: Option<String>,
    pub embedding_model_id: String,
    pub embedding_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    /// A document is live iff it has not been soft-deleted
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A stored chunk with its vector-index mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub tenant_id: String,
    pub namespace: String,
    /// SHA-256 of the raw chunk text
    pub chunk_hash: String,
    pub text: String,
    /// Enriched alternative presented to the embedder
    pub embed_text: Option<String>,
    pub offset_start: Option<i64>,
    pub offset_end: Option<i64>,
    pub metadata: Value,
    pub policy_id: Option<String>,
    pub embedding_model_id: String,
    pub embedding_version: String,
    /// Position within the current vector index, None while pending rebuild
    pub faiss_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Deterministic chunk id: `{doc_id}#c{ordinal:04}`
pub fn chunk_id_for(doc_id: &str, ordinal: usize) -> String {
    format!("{}#c{:04}", doc_id, ordinal)
}

/// Tracking row for one persisted vector index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub tenant_id: String,
    pub namespace: String,
    pub embedding_version: String,
    pub faiss_path: String,
    pub ntotal: i64,
    pub dimension: i64,
    pub dirty: bool,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Job type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestDocs,
    RebuildIndex,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::IngestDocs => write!(f, "ingest_docs"),
            JobType::RebuildIndex => write!(f, "rebuild_index"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest_docs" => Ok(JobType::IngestDocs),
            "rebuild_index" => Ok(JobType::RebuildIndex),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: Value,
    pub status: JobStatus,
    pub progress: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queue counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

// ============================================================================
// API request / response types
// ============================================================================

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Upsert request for a single document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocUpsertRequest {
    pub tenant_id: String,
    pub namespace: String,
    pub doc_id: String,
    #[serde(default)]
    pub source: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub chunk_strategy: Option<String>,
    #[serde(default)]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub enrich_context: bool,
}

/// Outcome of a single upsert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub chunks_created: usize,
    pub was_update: bool,
    pub skipped: bool,
}

/// Response for single/batch upsert endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub accepted: usize,
    pub upserted_docs: usize,
    pub skipped_docs: usize,
    pub chunks_created: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Batch upsert request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpsertRequest {
    pub docs: Vec<DocUpsertRequest>,
    #[serde(default)]
    pub async_mode: bool,
}

/// Response to a document deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub chunks_deleted: usize,
    pub job_id: String,
}

/// Rebuild request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildRequest {
    pub tenant_id: String,
    pub namespace: String,
    #[serde(default)]
    pub embedding_version: Option<String>,
    #[serde(default)]
    pub reembed: bool,
    #[serde(default)]
    pub new_embedding_version: Option<String>,
}

/// Search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub tenant_id: String,
    pub namespace: String,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub embedding_version: Option<String>,
}

/// A single search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub doc_id: String,
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// Search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub chunks: Vec<ChunkHit>,
    pub total_found: usize,
}

/// Aggregated document analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAnalysis {
    pub document_type: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub language: String,
    pub page_count: usize,
    pub has_tables: bool,
    pub has_images: bool,
    pub main_entities: Vec<String>,
    pub main_topics: Vec<String>,
    pub suggested_chunk_strategy: String,
    pub suggested_embed_model: String,
    #[serde(default)]
    pub extra: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_roundtrip() {
        for job_type in [JobType::IngestDocs, JobType::RebuildIndex] {
            let s = job_type.to_string();
            let parsed: JobType = s.parse().unwrap();
            assert_eq!(job_type, parsed);
        }
    }

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let s = status.to_string();
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(status, parsed);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id_for("doc-1", 0), "doc-1#c0000");
        assert_eq!(chunk_id_for("doc-1", 42), "doc-1#c0042");
        assert_eq!(chunk_id_for("doc-1", 12345), "doc-1#c12345");
    }

    #[test]
    fn test_upsert_request_defaults() {
        let req: DocUpsertRequest = serde_json::from_str(
            r#"{"tenant_id":"t","namespace":"n","doc_id":"d","text":"hello"}"#,
        )
        .unwrap();
        assert_eq!(req.chunk_overlap, 0);
        assert!(req.enrich_context);
        assert!(req.chunk_strategy.is_none());
    }

    #[test]
    fn test_search_request_default_top_k() {
        let req: SearchRequest = serde_json::from_str(
            r#"{"tenant_id":"t","namespace":"n","query":"hello"}"#,
        )
        .unwrap();
        assert_eq!(req.top_k, 5);
    }
}
