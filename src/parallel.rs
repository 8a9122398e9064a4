//! Parallel multi-device embedder
//!
//! Distributes a batch of texts over device-bound workers, each lazily
//! loading its own encoder instance. Slices are contiguous and results are
//! reassembled in slice order, so output order always equals input order.
//! A failed slice is retried on the CPU fallback encoder; only when that
//! also fails does the whole call error out.

use crate::config::EmbeddingSettings;
use crate::embed::{device_for_index, BertEncoder, Encoder};
use crate::gpu::GpuTaskManager;
use anyhow::{Context, Result};
use candle_core::Device;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Batches smaller than this run on a single worker
const MIN_TEXTS_FOR_PARALLEL: usize = 10;

/// Worker key: a device index, or the CPU fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WorkerKey {
    Device(usize),
    Cpu,
}

/// Options for one embed call
#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub cleanup_before: bool,
    pub cleanup_after: bool,
    pub min_texts_for_parallel: usize,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            cleanup_before: true,
            cleanup_after: true,
            min_texts_for_parallel: MIN_TEXTS_FOR_PARALLEL,
        }
    }
}

/// Worker-per-device embedding pool
pub struct ParallelEmbedder {
    settings: EmbeddingSettings,
    gpu: Arc<GpuTaskManager>,
    workers: Mutex<HashMap<WorkerKey, Arc<BertEncoder>>>,
}

impl ParallelEmbedder {
    pub fn new(settings: EmbeddingSettings, gpu: Arc<GpuTaskManager>) -> Self {
        Self {
            settings,
            gpu,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Devices eligible for embedding: preferred devices first, then the
    /// free pool, bounded by the configured maximum
    fn available_devices(&self) -> Vec<usize> {
        let free = self
            .gpu
            .free(self.settings.min_free_mb, self.settings.max_temp_c);

        let mut devices: Vec<usize> = self
            .settings
            .preferred_devices
            .iter()
            .copied()
            .filter(|d| free.contains(d))
            .collect();
        for device in free {
            if !devices.contains(&device) {
                devices.push(device);
            }
        }
        devices.truncate(self.settings.max_parallel_devices);
        devices
    }

    fn get_or_create_worker(&self, key: WorkerKey) -> Result<Arc<BertEncoder>> {
        {
            let workers = self.workers.lock().unwrap();
            if let Some(worker) = workers.get(&key) {
                return Ok(Arc::clone(worker));
            }
        }

        let device = match key {
            WorkerKey::Device(index) => device_for_index(index)?,
            WorkerKey::Cpu => Device::Cpu,
        };
        info!(?key, "loading encoder for worker");
        let encoder = Arc::new(
            BertEncoder::load(&self.settings.model_name, self.settings.dimension, device)
                .with_context(|| format!("failed to load encoder for worker {:?}", key))?,
        );

        let mut workers = self.workers.lock().unwrap();
        Ok(Arc::clone(workers.entry(key).or_insert(encoder)))
    }

    fn encode_on_worker(&self, key: WorkerKey, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let worker = self.get_or_create_worker(key)?;
        let batch_size = self.settings.batch_size_per_device.max(1);
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            all.extend(worker.encode(batch)?);
        }
        Ok(all)
    }

    fn encode_on_cpu(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        info!(count = texts.len(), "CPU fallback embedding");
        self.encode_on_worker(WorkerKey::Cpu, texts)
    }

    /// Split into `worker_count` contiguous slices of ceil(n / worker_count)
    fn slices(texts: &[String], worker_count: usize) -> Vec<&[String]> {
        let n = texts.len();
        let per_worker = n.div_ceil(worker_count);
        texts.chunks(per_worker).collect()
    }

    /// Embed texts across the available devices
    pub fn embed(&self, texts: &[String], options: &EmbedOptions) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        if options.cleanup_before {
            self.gpu.cleanup_framework();
        }

        let devices = self.available_devices();
        let result = self.embed_inner(texts, options, &devices);

        if options.cleanup_after {
            // Workers stay loaded; only transient buffers are released
            self.gpu.cleanup_framework();
        }
        result
    }

    fn embed_inner(
        &self,
        texts: &[String],
        options: &EmbedOptions,
        devices: &[usize],
    ) -> Result<Vec<Vec<f32>>> {
        if devices.is_empty() {
            return self.encode_on_cpu(texts);
        }

        // Small batch or single device: no fan-out
        if texts.len() < options.min_texts_for_parallel || devices.len() == 1 {
            match self.encode_on_worker(WorkerKey::Device(devices[0]), texts) {
                Ok(embeddings) => return Ok(embeddings),
                Err(err) => {
                    warn!(device = devices[0], error = %err, "single-device embed failed, trying CPU");
                    return self.encode_on_cpu(texts);
                }
            }
        }

        let slices = Self::slices(texts, devices.len());
        info!(
            texts = texts.len(),
            devices = devices.len(),
            slices = slices.len(),
            "parallel embedding"
        );

        // One scoped thread per slice, pinned to its device; results keyed
        // by slice index so order is deterministic
        let mut results: Vec<Option<Result<Vec<Vec<f32>>>>> =
            (0..slices.len()).map(|_| None).collect();
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for (slice_idx, slice) in slices.iter().enumerate() {
                let device = devices[slice_idx % devices.len()];
                handles.push((
                    slice_idx,
                    scope.spawn(move || self.encode_on_worker(WorkerKey::Device(device), slice)),
                ));
            }
            for (slice_idx, handle) in handles {
                results[slice_idx] = Some(match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("embedding worker panicked")),
                });
            }
        });

        // Retry failed slices on CPU, then reassemble in order
        let mut output = Vec::with_capacity(texts.len());
        let mut errors = Vec::new();
        for (slice_idx, result) in results.into_iter().enumerate() {
            match result.unwrap() {
                Ok(embeddings) => output.extend(embeddings),
                Err(err) => {
                    warn!(slice = slice_idx, error = %err, "slice failed, retrying on CPU");
                    match self.encode_on_cpu(slices[slice_idx]) {
                        Ok(embeddings) => output.extend(embeddings),
                        Err(cpu_err) => errors.push(format!(
                            "slice {}: {} (CPU fallback: {})",
                            slice_idx, err, cpu_err
                        )),
                    }
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("embedding failed: {}", errors.join("; "));
        }
        Ok(output)
    }

    /// Drop all loaded worker models to free device memory
    pub fn unload_all(&self) {
        let mut workers = self.workers.lock().unwrap();
        let count = workers.len();
        workers.clear();
        if count > 0 {
            info!(count, "unloaded embedding workers");
        }
    }

    /// Loaded worker count (status surface)
    pub fn loaded_workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

impl Encoder for ParallelEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed(texts, &EmbedOptions::default())
    }

    fn dimension(&self) -> usize {
        self.settings.dimension
    }

    fn model_id(&self) -> &str {
        &self.settings.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {}", i)).collect()
    }

    #[test]
    fn test_slices_are_contiguous_and_cover_input() {
        let input = texts(10);
        let slices = ParallelEmbedder::slices(&input, 3);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), 4);
        assert_eq!(slices[1].len(), 4);
        assert_eq!(slices[2].len(), 2);
        let rejoined: Vec<String> = slices.concat();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn test_slices_single_worker() {
        let input = texts(5);
        let slices = ParallelEmbedder::slices(&input, 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);
    }

    #[test]
    fn test_slices_more_workers_than_texts() {
        let input = texts(2);
        let slices = ParallelEmbedder::slices(&input, 8);
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.len() == 1));
    }

    #[test]
    fn test_unload_clears_workers() {
        let embedder = ParallelEmbedder::new(
            EmbeddingSettings::default(),
            Arc::new(GpuTaskManager::new(vec![])),
        );
        assert_eq!(embedder.loaded_workers(), 0);
        embedder.unload_all();
        assert_eq!(embedder.loaded_workers(), 0);
    }

    #[test]
    fn test_available_devices_respects_preference_order() {
        // With no nvidia-smi in the test environment the free pool is empty,
        // so the preferred list filters down to nothing
        let settings = EmbeddingSettings {
            preferred_devices: vec![6, 7],
            ..Default::default()
        };
        let embedder = ParallelEmbedder::new(settings, Arc::new(GpuTaskManager::new(vec![])));
        assert!(embedder.available_devices().is_empty());
    }
}
