//! Flat inner-product vector index with atomic persistence
//!
//! One index file per (tenant, namespace, embedding_version). Vectors are
//! expected L2-normalized, so inner product equals cosine similarity.
//! Positions are assigned sequentially from the previous ntotal; rebuild
//! semantics depend on these deterministic positional ids, which is why the
//! index stays flat (no HNSW/IVF).
//!
//! Saves go through a sibling temp file, fsync and an atomic rename: a crash
//! mid-save leaves the previous file byte-identical.

use crate::error::ServiceError;
use crate::text::path_safe;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const MAGIC: &[u8; 4] = b"SILO";
const FORMAT_VERSION: u32 = 1;

/// In-memory flat inner-product index
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, data: Vec::new() }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn ntotal(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    /// Append vectors; returns the assigned positions (sequential from the
    /// prior ntotal). Fails with a Conflict on dimension mismatch.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<Vec<i64>> {
        let start = self.ntotal();
        for vector in vectors {
            if vector.len() != self.dimension {
                return Err(ServiceError::conflict(format!(
                    "vector dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                ))
                .into());
            }
        }
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok((start..start + vectors.len()).map(|i| i as i64).collect())
    }

    /// Exact k-nearest search by inner product, scores descending
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dimension {
            return Err(ServiceError::conflict(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            ))
            .into());
        }
        let n = self.ntotal();
        let k = k.min(n);
        if k == 0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<(i64, f32)> = (0..n)
            .map(|i| {
                let row = &self.data[i * self.dimension..(i + 1) * self.dimension];
                let score: f32 = row.iter().zip(query.iter()).map(|(a, b)| a * b).sum();
                (i as i64, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Serialize to the on-disk format
    fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&(self.dimension as u32).to_le_bytes())?;
        writer.write_all(&(self.ntotal() as u64).to_le_bytes())?;
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Deserialize from the on-disk format
    fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).context("index file truncated")?;
        if &magic != MAGIC {
            return Err(ServiceError::Fatal("index file has invalid magic".into()).into());
        }

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let version = u32::from_le_bytes(buf4);
        if version != FORMAT_VERSION {
            return Err(ServiceError::Fatal(format!(
                "unsupported index format version {}",
                version
            ))
            .into());
        }

        reader.read_exact(&mut buf4)?;
        let dimension = u32::from_le_bytes(buf4) as usize;

        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let ntotal = u64::from_le_bytes(buf8) as usize;

        let mut data = vec![0f32; dimension * ntotal];
        let mut value = [0u8; 4];
        for slot in data.iter_mut() {
            reader.read_exact(&mut value).context("index file truncated")?;
            *slot = f32::from_le_bytes(value);
        }
        Ok(Self { dimension, data })
    }
}

/// Owns on-disk indices: load, atomic save, per-key write serialization
pub struct IndexManager {
    index_dir: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IndexManager {
    pub fn new(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)
            .with_context(|| format!("failed to create index dir {}", index_dir.display()))?;
        Ok(Self {
            index_dir: index_dir.to_path_buf(),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// File path for a key: `{tenant}_{namespace}_{version}.faiss`, sanitized
    pub fn index_path(&self, tenant_id: &str, namespace: &str, embedding_version: &str) -> PathBuf {
        let filename = format!(
            "{}_{}_{}.faiss",
            path_safe(tenant_id),
            path_safe(namespace),
            path_safe(embedding_version)
        );
        self.index_dir.join(filename)
    }

    /// Per-key write lock serializing upserts and rebuilds on the same index
    pub fn key_lock(&self, tenant_id: &str, namespace: &str, embedding_version: &str) -> Arc<Mutex<()>> {
        let key = format!("{}:{}:{}", tenant_id, namespace, embedding_version);
        let mut locks = self.key_locks.lock().unwrap();
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Load the index file at `path`, or an empty index of `default_dim`
    /// when the file does not exist
    pub fn load(&self, path: &Path, default_dim: usize) -> Result<FlatIndex> {
        if !path.exists() {
            return Ok(FlatIndex::new(default_dim));
        }
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open index file {}", path.display()))?;
        let index = FlatIndex::read_from(&mut file)
            .with_context(|| format!("failed to read index file {}", path.display()))?;
        Ok(index)
    }

    /// Like `load`, but a corrupt file degrades to an empty index (the caller
    /// marks the key dirty so a rebuild job restores it)
    pub fn load_or_empty(&self, path: &Path, default_dim: usize) -> (FlatIndex, bool) {
        match self.load(path, default_dim) {
            Ok(index) => (index, false),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "index file unreadable, starting empty");
                (FlatIndex::new(default_dim), true)
            }
        }
    }

    /// Atomic save: temp file in the same directory, fsync, rename over the
    /// destination. Non-atomic mode writes in place (faster, not crash-safe).
    pub fn save(&self, index: &FlatIndex, path: &Path, atomic: bool) -> Result<()> {
        if atomic {
            let dir = path.parent().unwrap_or(&self.index_dir);
            let mut temp = tempfile::Builder::new()
                .suffix(".faiss.tmp")
                .tempfile_in(dir)
                .context("failed to create temp index file")?;
            index.write_to(temp.as_file_mut())?;
            temp.as_file().sync_all().context("failed to fsync index file")?;
            temp.persist(path)
                .with_context(|| format!("failed to replace index file {}", path.display()))?;
            info!(path = %path.display(), ntotal = index.ntotal(), "saved index atomically");
        } else {
            let mut file = std::fs::File::create(path)?;
            index.write_to(&mut file)?;
            info!(path = %path.display(), ntotal = index.ntotal(), "saved index");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_add_assigns_sequential_ids() {
        let mut index = FlatIndex::new(4);
        let ids = index.add(&[unit(4, 0), unit(4, 1)]).unwrap();
        assert_eq!(ids, vec![0, 1]);
        let ids = index.add(&[unit(4, 2)]).unwrap();
        assert_eq!(ids, vec![2]);
        assert_eq!(index.ntotal(), 3);
    }

    #[test]
    fn test_dimension_mismatch_is_conflict() {
        let mut index = FlatIndex::new(4);
        let err = index.add(&[vec![1.0, 0.0]]).unwrap_err();
        let (status, _) = crate::error::classify(&err);
        assert_eq!(status, 500);
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn test_search_inner_product_order() {
        let mut index = FlatIndex::new(3);
        index
            .add(&[
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.7071, 0.7071, 0.0],
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(results[0].0, 0);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(results[1].0, 2);
        assert!((results[1].1 - 0.7071).abs() < 1e-3);
        assert_eq!(results[2].0, 1);
    }

    #[test]
    fn test_search_k_larger_than_ntotal() {
        let mut index = FlatIndex::new(2);
        index.add(&[vec![1.0, 0.0]]).unwrap();
        let results = index.search(&[1.0, 0.0], 100).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_search_empty_index() {
        let index = FlatIndex::new(2);
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let path = manager.index_path("t1", "ns1", "v1");

        let mut index = FlatIndex::new(3);
        index.add(&[vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]).unwrap();
        manager.save(&index, &path, true).unwrap();

        let loaded = manager.load(&path, 3).unwrap();
        assert_eq!(loaded.ntotal(), 2);
        assert_eq!(loaded.dimension(), 3);
        let results = loaded.search(&[0.4, 0.5, 0.6], 1).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_load_missing_file_gives_empty_index() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let index = manager.load(&manager.index_path("t", "n", "v"), 8).unwrap();
        assert_eq!(index.ntotal(), 0);
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn test_corrupt_file_detected() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let path = manager.index_path("t", "n", "v");
        std::fs::write(&path, b"not an index file at all").unwrap();

        assert!(manager.load(&path, 4).is_err());
        let (index, corrupt) = manager.load_or_empty(&path, 4);
        assert!(corrupt);
        assert_eq!(index.ntotal(), 0);
    }

    #[test]
    fn test_atomic_save_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let path = manager.index_path("t", "n", "v");

        let mut first = FlatIndex::new(2);
        first.add(&[vec![1.0, 0.0]]).unwrap();
        manager.save(&first, &path, true).unwrap();
        let before = std::fs::read(&path).unwrap();

        let mut second = FlatIndex::new(2);
        second.add(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        manager.save(&second, &path, true).unwrap();
        let after = std::fs::read(&path).unwrap();

        assert_ne!(before, after);
        let loaded = manager.load(&path, 2).unwrap();
        assert_eq!(loaded.ntotal(), 2);

        // No temp droppings remain after the save
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_index_path_is_sanitized() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let path = manager.index_path("ten/ant", "name:space", "v/1");
        let filename = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(filename, "ten_ant_name_space_v_1.faiss");
    }

    #[test]
    fn test_key_lock_is_shared_per_key() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new(dir.path()).unwrap();
        let a = manager.key_lock("t", "n", "v");
        let b = manager.key_lock("t", "n", "v");
        let c = manager.key_lock("t", "other", "v");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
