//! Ingest pipeline
//!
//! The upsert coordinator drives a document through content-hash resolution,
//! chunking, optional enrichment, embedding, and persistence. Enrichment and
//! embedding are slow external work, so they run between transactions; the
//! hash decision is re-validated inside the short final write transaction,
//! and the vector index file is saved atomically before that transaction
//! commits.

pub mod rebuild;

use crate::bm25::Bm25Index;
use crate::chunking::{strategy_for_document_type, StrategyMetadata, StrategyRegistry};
use crate::embed::Encoder;
use crate::enrich::{ContextEnricher, DocContext};
use crate::error::ServiceError;
use crate::gpu::{GpuTaskManager, TaskKind};
use crate::index::IndexManager;
use crate::lock::PhaseLock;
use crate::status::StatusReporter;
use crate::store::Store;
use crate::text::{chunk_hash, doc_hash};
use crate::types::{chunk_id_for, ChunkRecord, DocUpsertRequest, Document, UpsertOutcome, UpsertResponse};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Orchestrates upserts and deletions against store, indices and sidecars
pub struct UpsertCoordinator {
    store: Store,
    indexes: Arc<IndexManager>,
    registry: Arc<StrategyRegistry>,
    encoder: Arc<dyn Encoder>,
    enricher: Option<Arc<ContextEnricher>>,
    bm25: Option<Arc<Bm25Index>>,
    gpu: Arc<GpuTaskManager>,
    phase_lock: Option<PhaseLock>,
    reporter: StatusReporter,
    embedding_version: String,
}

impl UpsertCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        indexes: Arc<IndexManager>,
        registry: Arc<StrategyRegistry>,
        encoder: Arc<dyn Encoder>,
        enricher: Option<Arc<ContextEnricher>>,
        bm25: Option<Arc<Bm25Index>>,
        gpu: Arc<GpuTaskManager>,
        phase_lock: Option<PhaseLock>,
        reporter: StatusReporter,
        embedding_version: String,
    ) -> Self {
        Self {
            store,
            indexes,
            registry,
            encoder,
            enricher,
            bm25,
            gpu,
            phase_lock,
            reporter,
            embedding_version,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    pub fn embedding_version(&self) -> &str {
        &self.embedding_version
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    /// Embed a batch under the GPU contract: task manager acquire plus the
    /// cross-process phase lock
    pub(crate) fn embed_locked(&self, phase: &str, doc_id: Option<&str>, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _phase_guard = match &self.phase_lock {
            Some(lock) => Some(lock.acquire(phase, doc_id)?),
            None => None,
        };
        self.gpu.acquire(TaskKind::PytorchEmbedding, doc_id);
        let result = self.encoder.encode(texts);
        self.gpu.release(true);
        result
    }

    /// Upsert one document. Same doc_id with byte-identical normalized text
    /// produces zero writes.
    pub fn upsert(&self, req: &DocUpsertRequest) -> Result<UpsertOutcome> {
        let result = self.upsert_inner(req);
        if let Err(err) = &result {
            self.reporter.failed(&req.doc_id, &format!("{:#}", err), "upsert");
        }
        result
    }

    fn upsert_inner(&self, req: &DocUpsertRequest) -> Result<UpsertOutcome> {
        validate_request(req)?;
        let hash = doc_hash(&req.text);

        // Cheap skip check before any heavy work; re-validated inside the
        // final transaction
        let existing = self.store.get_document(&req.doc_id)?;
        if let Some(doc) = &existing {
            if doc.is_live() && doc.doc_hash == hash {
                info!(doc_id = %req.doc_id, "unchanged document, skipping");
                return Ok(UpsertOutcome {
                    chunks_created: 0,
                    was_update: false,
                    skipped: true,
                });
            }
        }
        let was_update = existing.as_ref().map(|d| d.is_live()).unwrap_or(false);

        let filename = req.metadata.get("filename").and_then(Value::as_str);
        self.reporter.received(&req.doc_id, filename);

        // Chunk
        let strategy_hint = self.resolve_strategy(req);
        self.reporter.chunking(&req.doc_id, strategy_hint.as_deref());
        let overrides = (req.chunk_overlap > 0).then(|| json!({"overlap": req.chunk_overlap}));
        let strategy_meta = strategy_metadata_from(req);
        let chunks = self
            .registry
            .chunk_text(&req.text, strategy_hint.as_deref(), overrides.as_ref(), Some(&strategy_meta))
            .context("chunking failed")?;

        if chunks.is_empty() {
            // Empty input: still commit the document row (and retire old chunks)
            self.commit_empty(req, &hash, was_update)?;
            return Ok(UpsertOutcome {
                chunks_created: 0,
                was_update,
                skipped: false,
            });
        }

        // Enrich (between transactions, bounded concurrency)
        let enriched = match (&self.enricher, req.enrich_context) {
            (Some(enricher), true) if enricher.enabled() => {
                self.reporter.enriching(&req.doc_id, 0, chunks.len());
                let doc_type = strategy_meta.doc_type.clone().unwrap_or_default();
                let ctx = DocContext::from_metadata(&req.doc_id, &doc_type, &req.metadata);
                let enriched = enricher.enrich_batch(&chunks, &ctx);
                self.reporter.enriching(&req.doc_id, chunks.len(), chunks.len());
                Some(enriched)
            }
            _ => None,
        };
        let embed_input: &[String] = enriched.as_deref().unwrap_or(&chunks);

        // Embed (GPU phase)
        self.reporter.embedding(&req.doc_id, 0, chunks.len(), self.encoder.model_id());
        let embeddings = self
            .embed_locked("embedding", Some(&req.doc_id), embed_input)
            .context("embedding failed")?;
        if embeddings.len() != chunks.len() {
            return Err(ServiceError::Fatal(format!(
                "encoder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            ))
            .into());
        }
        self.reporter
            .embedding(&req.doc_id, chunks.len(), chunks.len(), self.encoder.model_id());

        // Final short write transaction, serialized per index key
        self.reporter.storing(&req.doc_id, chunks.len());
        let key_lock = self
            .indexes
            .key_lock(&req.tenant_id, &req.namespace, &self.embedding_version);
        let _key_guard = key_lock.lock().unwrap();

        let outcome = self.commit_chunks(req, &hash, was_update, &chunks, enriched.as_deref(), &embeddings)?;
        if outcome.skipped {
            // A concurrent writer landed identical content first
            return Ok(outcome);
        }

        // BM25 sidecar follows the committed state; failures only log
        if let Some(bm25) = &self.bm25 {
            if was_update {
                if let Err(err) = bm25.delete_doc(&req.doc_id) {
                    warn!(doc_id = %req.doc_id, error = %err, "BM25 delete failed");
                }
            }
            let entries: Vec<(String, String, String, String, String)> = chunks
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    (
                        chunk_id_for(&req.doc_id, i),
                        req.doc_id.clone(),
                        req.tenant_id.clone(),
                        req.namespace.clone(),
                        text.clone(),
                    )
                })
                .collect();
            if let Err(err) = bm25.add_chunks(&entries) {
                warn!(doc_id = %req.doc_id, error = %err, "BM25 indexing failed");
            }
        }

        self.reporter.completed(&req.doc_id, outcome.chunks_created);
        Ok(outcome)
    }

    /// Explicit strategy, or one derived from a hinted document type
    fn resolve_strategy(&self, req: &DocUpsertRequest) -> Option<String> {
        if let Some(strategy) = &req.chunk_strategy {
            return Some(strategy.clone());
        }
        req.metadata
            .get("document_type")
            .and_then(Value::as_str)
            .map(|doc_type| strategy_for_document_type(doc_type).to_string())
    }

    /// Commit a zero-chunk upsert: document row only, old chunks retired
    fn commit_empty(&self, req: &DocUpsertRequest, hash: &str, was_update: bool) -> Result<()> {
        let key_lock = self
            .indexes
            .key_lock(&req.tenant_id, &req.namespace, &self.embedding_version);
        let _key_guard = key_lock.lock().unwrap();

        self.store.transaction(|tx| {
            if was_update {
                Store::mark_chunks_deleted(tx, &req.doc_id)?;
            }
            Store::put_document(tx, &self.document_row(req, hash))?;
            if was_update {
                let meta = Store::get_index_meta_conn(
                    tx,
                    &req.tenant_id,
                    &req.namespace,
                    &self.embedding_version,
                )?;
                if let Some(meta) = meta {
                    Store::update_index_meta(
                        tx,
                        &req.tenant_id,
                        &req.namespace,
                        &self.embedding_version,
                        meta.ntotal,
                        true,
                    )?;
                }
            }
            Ok(())
        })?;

        if was_update {
            if let Some(bm25) = &self.bm25 {
                if let Err(err) = bm25.delete_doc(&req.doc_id) {
                    warn!(doc_id = %req.doc_id, error = %err, "BM25 delete failed");
                }
            }
        }
        Ok(())
    }

    fn document_row(&self, req: &DocUpsertRequest, hash: &str) -> Document {
        let now = Utc::now();
        Document {
            doc_id: req.doc_id.clone(),
            tenant_id: req.tenant_id.clone(),
            namespace: req.namespace.clone(),
            source: req.source.clone(),
            doc_hash: hash.to_string(),
            metadata: req.metadata.clone(),
            policy_id: req.policy_id.clone(),
            embedding_model_id: self.encoder.model_id().to_string(),
            embedding_version: self.embedding_version.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// The final write transaction: retire old chunks, upsert the document,
    /// insert chunk rows, add vectors, save the index atomically, commit.
    fn commit_chunks(
        &self,
        req: &DocUpsertRequest,
        hash: &str,
        was_update: bool,
        chunks: &[String],
        enriched: Option<&[String]>,
        embeddings: &[Vec<f32>],
    ) -> Result<UpsertOutcome> {
        let index_path = self
            .indexes
            .index_path(&req.tenant_id, &req.namespace, &self.embedding_version);
        let dim = self.encoder.dimension();

        self.store.transaction(|tx| {
            // Re-validate the skip decision: a concurrent writer may have
            // landed the same content while we were embedding
            if let Some(doc) = Store::get_document_conn(tx, &req.doc_id)? {
                if doc.is_live() && doc.doc_hash == hash {
                    return Ok(UpsertOutcome {
                        chunks_created: 0,
                        was_update: false,
                        skipped: true,
                    });
                }
            }

            if was_update {
                Store::mark_chunks_deleted(tx, &req.doc_id)?;
            }
            Store::put_document(tx, &self.document_row(req, hash))?;

            let meta = Store::get_or_create_index_meta(
                tx,
                &req.tenant_id,
                &req.namespace,
                &self.embedding_version,
                &index_path.to_string_lossy(),
                dim as i64,
            )?;
            if meta.dimension != dim as i64 {
                return Err(ServiceError::conflict(format!(
                    "index dimension {} does not match encoder dimension {} for {}:{}:{}",
                    meta.dimension, dim, req.tenant_id, req.namespace, self.embedding_version
                ))
                .into());
            }

            let (mut index, corrupt) = self
                .indexes
                .load_or_empty(std::path::Path::new(&meta.faiss_path), dim);
            // The file can sit behind the metadata (torn write recovered to
            // empty) or ahead of it (crash between the atomic rename and the
            // DB commit). Either way the positional mapping is unreliable
            // until a rebuild, so the key stays dirty; the add below still
            // lands so the data is not lost.
            let diverged = corrupt || (index.ntotal() as i64) != meta.ntotal;
            if diverged && !corrupt {
                warn!(
                    tenant_id = %req.tenant_id,
                    namespace = %req.namespace,
                    file_ntotal = index.ntotal(),
                    meta_ntotal = meta.ntotal,
                    "index file diverged from metadata, marking dirty"
                );
            }

            let faiss_ids = index.add(embeddings)?;

            let now = Utc::now();
            let rows: Vec<ChunkRecord> = chunks
                .iter()
                .enumerate()
                .map(|(i, text)| ChunkRecord {
                    chunk_id: chunk_id_for(&req.doc_id, i),
                    doc_id: req.doc_id.clone(),
                    tenant_id: req.tenant_id.clone(),
                    namespace: req.namespace.clone(),
                    chunk_hash: chunk_hash(text),
                    text: text.clone(),
                    embed_text: enriched.map(|e| e[i].clone()),
                    offset_start: None,
                    offset_end: None,
                    metadata: Value::Null,
                    policy_id: req.policy_id.clone(),
                    embedding_model_id: self.encoder.model_id().to_string(),
                    embedding_version: self.embedding_version.clone(),
                    faiss_id: Some(faiss_ids[i]),
                    created_at: now,
                    deleted_at: None,
                })
                .collect();
            Store::insert_chunks(tx, &rows)?;

            // Atomic file save precedes the commit: observers never see
            // committed faiss_ids the file does not contain
            self.indexes
                .save(&index, std::path::Path::new(&meta.faiss_path), true)?;

            let dirty = was_update || diverged;
            Store::update_index_meta(
                tx,
                &req.tenant_id,
                &req.namespace,
                &self.embedding_version,
                index.ntotal() as i64,
                dirty,
            )?;

            Ok(UpsertOutcome {
                chunks_created: chunks.len(),
                was_update,
                skipped: false,
            })
        })
    }

    /// Upsert a batch; per-document failures are logged and counted, the
    /// batch itself keeps going
    pub fn upsert_batch(&self, docs: &[DocUpsertRequest]) -> UpsertResponse {
        let mut response = UpsertResponse {
            accepted: docs.len(),
            ..Default::default()
        };
        for doc in docs {
            match self.upsert(doc) {
                Ok(outcome) if outcome.skipped => response.skipped_docs += 1,
                Ok(outcome) => {
                    response.upserted_docs += 1;
                    response.chunks_created += outcome.chunks_created;
                }
                Err(err) => {
                    warn!(doc_id = %doc.doc_id, error = %format!("{:#}", err), "batch upsert: document failed");
                    response.skipped_docs += 1;
                }
            }
        }
        response
    }

    /// Soft-delete a document (tenant/namespace checked). Returns the number
    /// of chunks retired; NotFound for unknown or already-deleted documents.
    pub fn delete_document(&self, tenant_id: &str, namespace: &str, doc_id: &str) -> Result<usize> {
        let doc = self
            .store
            .get_document(doc_id)?
            .filter(|d| d.tenant_id == tenant_id && d.namespace == namespace);
        match doc {
            Some(d) if d.is_live() => {}
            _ => {
                return Err(ServiceError::not_found(format!("document {} not found", doc_id)).into())
            }
        }

        let chunks_deleted = self
            .store
            .mark_document_deleted(doc_id)?
            .ok_or_else(|| {
                anyhow::Error::from(ServiceError::not_found(format!("document {} not found", doc_id)))
            })?;

        if let Some(bm25) = &self.bm25 {
            if let Err(err) = bm25.delete_doc(doc_id) {
                warn!(doc_id, error = %err, "BM25 delete failed");
            }
        }

        info!(doc_id, chunks_deleted, "document soft-deleted");
        Ok(chunks_deleted)
    }
}

fn validate_request(req: &DocUpsertRequest) -> Result<()> {
    if req.tenant_id.trim().is_empty() {
        return Err(ServiceError::validation("tenant_id is required").into());
    }
    if req.namespace.trim().is_empty() {
        return Err(ServiceError::validation("namespace is required").into());
    }
    if req.doc_id.trim().is_empty() {
        return Err(ServiceError::validation("doc_id is required").into());
    }
    Ok(())
}

fn strategy_metadata_from(req: &DocUpsertRequest) -> StrategyMetadata {
    StrategyMetadata {
        filename: req
            .metadata
            .get("filename")
            .and_then(Value::as_str)
            .map(str::to_string),
        mime_type: req
            .metadata
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        doc_type: req
            .metadata
            .get("document_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        source: req.source.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let mut req = DocUpsertRequest {
            tenant_id: "t".into(),
            namespace: "n".into(),
            doc_id: "d".into(),
            source: None,
            text: "text".into(),
            metadata: Value::Null,
            policy_id: None,
            chunk_strategy: None,
            chunk_overlap: 0,
            enrich_context: false,
        };
        assert!(validate_request(&req).is_ok());

        req.tenant_id = " ".into();
        let err = validate_request(&req).unwrap_err();
        let (status, _) = crate::error::classify(&err);
        assert_eq!(status, 400);
    }

    #[test]
    fn test_strategy_metadata_extraction() {
        let req = DocUpsertRequest {
            tenant_id: "t".into(),
            namespace: "n".into(),
            doc_id: "d".into(),
            source: Some("upload".into()),
            text: "text".into(),
            metadata: json!({
                "filename": "report.pdf",
                "content_type": "application/pdf",
                "document_type": "jaarrekening"
            }),
            policy_id: None,
            chunk_strategy: None,
            chunk_overlap: 0,
            enrich_context: false,
        };
        let meta = strategy_metadata_from(&req);
        assert_eq!(meta.filename.as_deref(), Some("report.pdf"));
        assert_eq!(meta.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(meta.doc_type.as_deref(), Some("jaarrekening"));
        assert_eq!(meta.source.as_deref(), Some("upload"));
    }
}
