//! Index rebuild engine
//!
//! Rebuilds one vector index from the live chunks of its key, recomputing
//! embeddings (original vectors are not persisted). With `reembed` the raw
//! chunk text is encoded and the chunks may move to a new embedding version;
//! without it the enriched `embed_text` is preferred. The fresh index assigns
//! ordinal positions 0..n-1 and is saved atomically before the chunk updates
//! commit, which also clears the dirty flag.
//!
//! Job handlers for `ingest_docs` and `rebuild_index` are registered here at
//! startup; rebuilds run through the job worker, serialized per key.

use super::UpsertCoordinator;
use crate::error::ServiceError;
use crate::index::FlatIndex;
use crate::queue::{JobQueue, JobWorker};
use crate::store::Store;
use crate::types::{DocUpsertRequest, JobStatus, JobType};
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

impl UpsertCoordinator {
    /// Full rebuild for a (tenant, namespace, version) key.
    /// Returns the number of vectors in the fresh index.
    pub fn rebuild_index(
        &self,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
        reembed: bool,
        new_embedding_version: Option<&str>,
    ) -> Result<usize> {
        let key_lock = self.indexes().key_lock(tenant_id, namespace, embedding_version);
        let _key_guard = key_lock.lock().unwrap();

        let dim = self.encoder().dimension();
        let chunks = self
            .store()
            .live_chunks(tenant_id, namespace, embedding_version)?;
        info!(
            tenant_id,
            namespace,
            embedding_version,
            chunks = chunks.len(),
            reembed,
            "rebuilding index"
        );

        let index_path = self.indexes().index_path(tenant_id, namespace, embedding_version);
        if chunks.is_empty() {
            // Persist an empty index and clear the dirty flag
            let index = FlatIndex::new(dim);
            let indexes = Arc::clone(self.indexes());
            self.store().transaction(|tx| {
                let meta = Store::get_or_create_index_meta(
                    tx,
                    tenant_id,
                    namespace,
                    embedding_version,
                    &index_path.to_string_lossy(),
                    dim as i64,
                )?;
                indexes.save(&index, Path::new(&meta.faiss_path), true)?;
                Store::update_index_meta(tx, tenant_id, namespace, embedding_version, 0, false)
            })?;
            return Ok(0);
        }

        // Input texts: raw text when re-embedding, else the enriched variant
        let texts: Vec<String> = chunks
            .iter()
            .map(|chunk| {
                if reembed {
                    chunk.text.clone()
                } else {
                    chunk.embed_text.clone().unwrap_or_else(|| chunk.text.clone())
                }
            })
            .collect();

        let embeddings = self
            .embed_locked("rebuild_embedding", None, &texts)
            .context("rebuild embedding failed")?;

        let mut index = FlatIndex::new(dim);
        let faiss_ids = index.add(&embeddings)?;

        let final_version = match (reembed, new_embedding_version) {
            (true, Some(version)) => version,
            _ => embedding_version,
        };
        let version_changed = final_version != embedding_version;
        let final_path = self.indexes().index_path(tenant_id, namespace, final_version);
        let model_id = self.encoder().model_id().to_string();
        let indexes = Arc::clone(self.indexes());

        self.store().transaction(|tx| {
            for (chunk, faiss_id) in chunks.iter().zip(&faiss_ids) {
                Store::set_faiss_id(tx, &chunk.chunk_id, *faiss_id)?;
                if version_changed {
                    Store::set_chunk_version(tx, &chunk.chunk_id, final_version, &model_id)?;
                }
            }

            let meta = Store::get_or_create_index_meta(
                tx,
                tenant_id,
                namespace,
                final_version,
                &final_path.to_string_lossy(),
                dim as i64,
            )?;
            if meta.dimension != dim as i64 {
                return Err(ServiceError::conflict(format!(
                    "index dimension {} does not match encoder dimension {}",
                    meta.dimension, dim
                ))
                .into());
            }

            indexes.save(&index, Path::new(&meta.faiss_path), true)?;
            Store::update_index_meta(
                tx,
                tenant_id,
                namespace,
                final_version,
                index.ntotal() as i64,
                false,
            )?;

            if version_changed {
                // The old version's index no longer matches any live chunk
                Store::mark_index_dirty_tx(tx, tenant_id, namespace, embedding_version)?;
            }
            Ok(())
        })?;

        info!(
            tenant_id,
            namespace,
            version = final_version,
            ntotal = index.ntotal(),
            "rebuild complete"
        );
        Ok(index.ntotal())
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::validation(format!("job payload missing '{}'", key)).into())
}

/// Wire the job handlers into the worker. Called once at startup.
pub fn register_handlers(worker: &mut JobWorker, coordinator: Arc<UpsertCoordinator>, queue: JobQueue) {
    let rebuild_coordinator = Arc::clone(&coordinator);
    worker.register(
        JobType::RebuildIndex,
        Arc::new(move |_job_id, payload| {
            let tenant_id = payload_str(payload, "tenant_id")?;
            let namespace = payload_str(payload, "namespace")?;
            let default_version = rebuild_coordinator.embedding_version().to_string();
            let version = payload
                .get("embedding_version")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(&default_version);
            let reembed = payload.get("reembed").and_then(Value::as_bool).unwrap_or(false);
            let new_version = payload
                .get("new_embedding_version")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());

            rebuild_coordinator
                .rebuild_index(tenant_id, namespace, version, reembed, new_version)
                .map(|_| ())
        }),
    );

    worker.register(
        JobType::IngestDocs,
        Arc::new(move |job_id, payload| {
            let docs: Vec<DocUpsertRequest> = serde_json::from_value(
                payload.get("docs").cloned().unwrap_or(Value::Array(vec![])),
            )
            .context("invalid ingest_docs payload")?;
            if docs.is_empty() {
                return Ok(());
            }

            let total = docs.len();
            let mut failures: Vec<String> = Vec::new();
            for (i, doc) in docs.iter().enumerate() {
                if let Err(err) = coordinator.upsert(doc) {
                    failures.push(format!("{}: {:#}", doc.doc_id, err));
                }
                let progress = ((i + 1) * 100 / total) as i64;
                let _ = queue.update_status(job_id, JobStatus::Running, Some(progress), None);
            }

            if !failures.is_empty() {
                anyhow::bail!("{}/{} documents failed: {}", failures.len(), total, failures.join("; "));
            }
            Ok(())
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_str_present() {
        let payload = json!({"tenant_id": "t1"});
        assert_eq!(payload_str(&payload, "tenant_id").unwrap(), "t1");
    }

    #[test]
    fn test_payload_str_missing_is_validation_error() {
        let payload = json!({});
        let err = payload_str(&payload, "tenant_id").unwrap_err();
        let (status, msg) = crate::error::classify(&err);
        assert_eq!(status, 400);
        assert!(msg.contains("tenant_id"));
    }

    #[test]
    fn test_payload_str_empty_rejected() {
        let payload = json!({"namespace": ""});
        assert!(payload_str(&payload, "namespace").is_err());
    }
}
