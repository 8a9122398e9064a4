//! Search engine
//!
//! Dense nearest-neighbour search over the flat index, filtered against the
//! store so soft-deleted chunks never surface, optionally fused with BM25 by
//! reciprocal rank and re-scored by the cross-encoder reranker service.

use crate::bm25::Bm25Index;
use crate::config::{FusionSettings, RerankSettings};
use crate::embed::Encoder;
use crate::error::ServiceError;
use crate::gpu::{GpuTaskManager, TaskKind};
use crate::index::IndexManager;
use crate::store::Store;
use crate::types::{ChunkHit, SearchRequest, SearchResponse};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dense candidates fetched per requested result
const OVERFETCH_FACTOR: usize = 3;

/// HTTP client for the cross-encoder reranker service
pub struct RerankClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl RerankClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Cross-encoder scores for (id, text) pairs; sorted best-first by the
    /// service. Any transport failure surfaces as an error so the caller can
    /// degrade to vector ordering.
    pub fn score(&self, query: &str, items: &[(String, String)], top_k: usize) -> Result<Vec<(String, f32)>> {
        let payload = json!({
            "query": query,
            "items": items
                .iter()
                .map(|(id, text)| json!({"id": id, "text": text, "metadata": {}}))
                .collect::<Vec<_>>(),
            "top_k": top_k,
        });

        let resp = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&payload)
            .send()
            .context("reranker unreachable")?
            .error_for_status()
            .context("reranker returned an error")?;
        let body: Value = resp.json().context("invalid reranker response")?;

        let scored = body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = item.get("id")?.as_str()?.to_string();
                        let score = item.get("score")?.as_f64()? as f32;
                        Some((id, score))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(scored)
    }
}

/// Reciprocal rank fusion of dense and sparse result lists.
/// Returns (chunk_id, combined, dense_score, sparse_score) sorted descending.
pub fn reciprocal_rank_fusion(
    dense: &[(String, f32)],
    sparse: &[(String, f32)],
    dense_weight: f32,
    sparse_weight: f32,
    rrf_k: usize,
) -> Vec<(String, f32, f32, f32)> {
    let mut fused: Vec<(String, f32, f32, f32)> = Vec::new();
    let dense_rank = |id: &str| dense.iter().position(|(cid, _)| cid == id).unwrap_or(dense.len());
    let sparse_rank = |id: &str| sparse.iter().position(|(cid, _)| cid == id).unwrap_or(sparse.len());

    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for (id, _) in dense.iter().chain(sparse.iter()) {
        if !seen.insert(id) {
            continue;
        }
        let dense_rrf = dense_weight / (rrf_k + dense_rank(id) + 1) as f32;
        let sparse_rrf = sparse_weight / (rrf_k + sparse_rank(id) + 1) as f32;
        let dense_score = dense.iter().find(|(cid, _)| cid == id).map(|(_, s)| *s).unwrap_or(0.0);
        let sparse_score = sparse.iter().find(|(cid, _)| cid == id).map(|(_, s)| *s).unwrap_or(0.0);
        fused.push((id.clone(), dense_rrf + sparse_rrf, dense_score, sparse_score));
    }

    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Dense + hybrid + rerank search over one (tenant, namespace, version) key
pub struct SearchEngine {
    store: Store,
    indexes: Arc<IndexManager>,
    encoder: Arc<dyn Encoder>,
    bm25: Option<Arc<Bm25Index>>,
    reranker: Option<RerankClient>,
    gpu: Arc<GpuTaskManager>,
    fusion: FusionSettings,
    rerank: RerankSettings,
    default_version: String,
}

impl SearchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        indexes: Arc<IndexManager>,
        encoder: Arc<dyn Encoder>,
        bm25: Option<Arc<Bm25Index>>,
        reranker: Option<RerankClient>,
        gpu: Arc<GpuTaskManager>,
        fusion: FusionSettings,
        rerank: RerankSettings,
        default_version: String,
    ) -> Self {
        Self {
            store,
            indexes,
            encoder,
            bm25,
            reranker,
            gpu,
            fusion,
            rerank,
            default_version,
        }
    }

    pub fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        if req.query.trim().is_empty() {
            return Err(ServiceError::validation("query is required").into());
        }
        let top_k = req.top_k.max(1);
        let version = req.embedding_version.as_deref().unwrap_or(&self.default_version);

        // Unknown key is a 404; a known-but-empty index is an empty result
        let meta = self
            .store
            .get_index_meta(&req.tenant_id, &req.namespace, version)?
            .ok_or_else(|| {
                anyhow::Error::from(ServiceError::not_found(format!(
                    "index for tenant '{}' namespace '{}' not found",
                    req.tenant_id, req.namespace
                )))
            })?;

        let index = self
            .indexes
            .load(Path::new(&meta.faiss_path), meta.dimension as usize)
            .map_err(|err| {
                anyhow::Error::from(ServiceError::Fatal(format!("index unreadable: {:#}", err)))
            })?;
        if index.ntotal() == 0 {
            return Ok(SearchResponse { chunks: vec![], total_found: 0 });
        }

        // Embed the query
        let query_vecs = self.encoder.encode(&[req.query.clone()])?;
        let query_vec = query_vecs
            .first()
            .ok_or_else(|| anyhow::anyhow!("encoder returned no query vector"))?;

        // Over-fetch so deleted-row filtering and reranking have headroom
        let mut candidates_k = top_k.saturating_mul(OVERFETCH_FACTOR);
        if self.rerank.enabled && self.reranker.is_some() {
            candidates_k = candidates_k.max(self.rerank.candidates);
        }
        candidates_k = candidates_k.min(index.ntotal());

        let neighbours = index.search(query_vec, candidates_k)?;

        // Resolve positions to live chunks; deleted rows are skipped here,
        // before any rebuild has run
        let mut hits: Vec<ChunkHit> = Vec::new();
        for (faiss_id, score) in neighbours {
            if let Some(chunk) =
                self.store
                    .find_chunk_by_faiss_id(&req.tenant_id, &req.namespace, version, faiss_id)?
            {
                hits.push(ChunkHit {
                    doc_id: chunk.doc_id,
                    chunk_id: chunk.chunk_id,
                    text: chunk.text,
                    score,
                    metadata: chunk.metadata,
                });
            }
        }
        debug!(candidates = hits.len(), "dense candidates resolved");

        // Optional sparse fusion
        if self.fusion.enabled {
            if let Some(bm25) = &self.bm25 {
                hits = self.fuse_sparse(req, version, hits, bm25, candidates_k)?;
            }
        }

        // Optional cross-encoder rerank
        if self.rerank.enabled {
            if let Some(reranker) = &self.reranker {
                hits = self.rerank_hits(&req.query, hits, top_k, reranker);
            }
        }

        let total_found = hits.len();
        hits.truncate(top_k);
        info!(
            tenant_id = %req.tenant_id,
            namespace = %req.namespace,
            returned = hits.len(),
            total_found,
            "search complete"
        );
        Ok(SearchResponse { chunks: hits, total_found })
    }

    fn fuse_sparse(
        &self,
        req: &SearchRequest,
        version: &str,
        dense_hits: Vec<ChunkHit>,
        bm25: &Bm25Index,
        candidates_k: usize,
    ) -> Result<Vec<ChunkHit>> {
        let sparse_hits = match bm25.search(&req.tenant_id, &req.namespace, &req.query, candidates_k) {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "BM25 search failed, dense-only results");
                return Ok(dense_hits);
            }
        };
        if sparse_hits.is_empty() {
            return Ok(dense_hits);
        }

        let dense_pairs: Vec<(String, f32)> = dense_hits
            .iter()
            .map(|h| (h.chunk_id.clone(), h.score))
            .collect();
        let sparse_pairs: Vec<(String, f32)> = sparse_hits
            .iter()
            .map(|h| (h.chunk_id.clone(), h.score))
            .collect();

        let fused = reciprocal_rank_fusion(
            &dense_pairs,
            &sparse_pairs,
            self.fusion.dense_weight,
            self.fusion.sparse_weight,
            self.fusion.rrf_k,
        );

        let mut by_id: std::collections::HashMap<String, ChunkHit> = dense_hits
            .into_iter()
            .map(|h| (h.chunk_id.clone(), h))
            .collect();

        let mut result = Vec::with_capacity(fused.len());
        for (chunk_id, combined, _dense, _sparse) in fused {
            if let Some(mut hit) = by_id.remove(&chunk_id) {
                hit.score = combined;
                result.push(hit);
            } else if let Some(chunk) = self.store.get_chunk_live(&chunk_id)? {
                // Sparse-only hit; keep the partition invariant
                if chunk.tenant_id == req.tenant_id
                    && chunk.namespace == req.namespace
                    && chunk.embedding_version == version
                {
                    result.push(ChunkHit {
                        doc_id: chunk.doc_id,
                        chunk_id: chunk.chunk_id,
                        text: chunk.text,
                        score: combined,
                        metadata: chunk.metadata,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Replace vector scores with cross-encoder scores for the top
    /// candidates; transport failures degrade to the existing ordering
    fn rerank_hits(
        &self,
        query: &str,
        hits: Vec<ChunkHit>,
        top_k: usize,
        reranker: &RerankClient,
    ) -> Vec<ChunkHit> {
        if hits.is_empty() {
            return hits;
        }
        let candidate_count = self.rerank.candidates.min(hits.len());
        let (candidates, rest) = hits.split_at(candidate_count);
        let items: Vec<(String, String)> = candidates
            .iter()
            .map(|h| (h.chunk_id.clone(), h.text.clone()))
            .collect();

        // Cross-encoder scoring is a framework GPU phase; release unloads
        self.gpu.acquire(TaskKind::PytorchReranking, None);
        let scored = reranker.score(query, &items, top_k);
        self.gpu.release(true);

        let scored = match scored {
            Ok(scored) => scored,
            Err(err) => {
                warn!(error = %err, "rerank failed, falling back to vector scores");
                return hits;
            }
        };

        let mut by_id: std::collections::HashMap<String, ChunkHit> = candidates
            .iter()
            .cloned()
            .map(|h| (h.chunk_id.clone(), h))
            .collect();

        let mut reranked: Vec<ChunkHit> = scored
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                by_id.remove(&chunk_id).map(|mut hit| {
                    hit.score = score;
                    if let Value::Object(map) = &mut hit.metadata {
                        map.insert("reranked".to_string(), Value::Bool(true));
                    } else {
                        hit.metadata = json!({"reranked": true});
                    }
                    hit
                })
            })
            .collect();
        reranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        reranked.extend(rest.iter().cloned());
        reranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(ids: &[(&str, f32)]) -> Vec<(String, f32)> {
        ids.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_rrf_overlapping_id_wins() {
        let dense = pairs(&[("shared", 0.9), ("dense-only", 0.8)]);
        let sparse = pairs(&[("shared", 5.0), ("sparse-only", 4.0)]);

        let fused = reciprocal_rank_fusion(&dense, &sparse, 0.7, 0.3, 60);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].0, "shared", "chunk present in both lists ranks first");
        // Carried-through raw scores
        assert!((fused[0].2 - 0.9).abs() < 1e-6);
        assert!((fused[0].3 - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_respects_weights() {
        let dense = pairs(&[("a", 1.0)]);
        let sparse = pairs(&[("b", 1.0)]);

        let fused = reciprocal_rank_fusion(&dense, &sparse, 0.9, 0.1, 60);
        let a = fused.iter().find(|f| f.0 == "a").unwrap();
        let b = fused.iter().find(|f| f.0 == "b").unwrap();
        assert!(a.1 > b.1, "heavier dense weight should rank dense hit first");
    }

    #[test]
    fn test_rrf_empty_sparse_keeps_dense_order() {
        let dense = pairs(&[("first", 0.9), ("second", 0.5)]);
        let fused = reciprocal_rank_fusion(&dense, &[], 0.7, 0.3, 60);
        assert_eq!(fused[0].0, "first");
        assert_eq!(fused[1].0, "second");
    }

    #[test]
    fn test_rrf_no_duplicates() {
        let dense = pairs(&[("x", 0.9)]);
        let sparse = pairs(&[("x", 3.0)]);
        let fused = reciprocal_rank_fusion(&dense, &sparse, 0.7, 0.3, 60);
        assert_eq!(fused.len(), 1);
    }

    #[test]
    fn test_rrf_formula() {
        let dense = pairs(&[("a", 1.0), ("b", 0.5)]);
        let fused = reciprocal_rank_fusion(&dense, &[], 1.0, 0.0, 60);
        // rank 0 -> 1/(60+1), rank 1 -> 1/(60+2)
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-6);
        assert!((fused[1].1 - 1.0 / 62.0).abs() < 1e-6);
    }
}
