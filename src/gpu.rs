//! GPU task manager
//!
//! Selects devices per task kind and performs inter-task memory hygiene.
//! LLM runtimes and the in-process embedding framework compete for the same
//! accelerators; switching between the two families triggers a best-effort
//! cleanup (unload resident LLM models, or free framework caches) so the next
//! task starts with room. Acquire/release are serialized by a process-local
//! mutex; cross-process exclusivity is the phase lock's job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Kind of GPU-bound task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Idle,
    OllamaAnalysis,
    OllamaEnrichment,
    PytorchEmbedding,
    PytorchReranking,
}

impl TaskKind {
    fn is_llm(&self) -> bool {
        matches!(self, TaskKind::OllamaAnalysis | TaskKind::OllamaEnrichment)
    }

    fn is_framework(&self) -> bool {
        matches!(self, TaskKind::PytorchEmbedding | TaskKind::PytorchReranking)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Idle => "idle",
            TaskKind::OllamaAnalysis => "ollama_analysis",
            TaskKind::OllamaEnrichment => "ollama_enrichment",
            TaskKind::PytorchEmbedding => "pytorch_embedding",
            TaskKind::PytorchReranking => "pytorch_reranking",
        }
    }
}

/// One device from the inventory
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub used_memory_mb: u64,
    pub utilization_pct: u32,
    pub temperature_c: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentTask {
    pub kind: TaskKind,
    pub doc_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub device_indices: Vec<usize>,
}

struct TaskState {
    current: Option<CurrentTask>,
    last_kind: Option<TaskKind>,
}

pub type CleanupHook = Box<dyn Fn() + Send + Sync>;

/// Process-local device selection and inter-task cleanup
pub struct GpuTaskManager {
    state: Mutex<TaskState>,
    /// Models the LLM runtime is asked to unload on a family switch
    llm_models: Vec<String>,
    /// Framework-side cache release (wired to the embedder pool at startup)
    framework_cleanup: RwLock<Option<CleanupHook>>,
}

impl GpuTaskManager {
    pub fn new(llm_models: Vec<String>) -> Self {
        Self {
            state: Mutex::new(TaskState { current: None, last_kind: None }),
            llm_models,
            framework_cleanup: RwLock::new(None),
        }
    }

    /// Register the framework-side cleanup hook (e.g. embedder model unload)
    pub fn set_framework_cleanup(&self, hook: CleanupHook) {
        *self.framework_cleanup.write().unwrap() = Some(hook);
    }

    // ========================================================================
    // Inventory
    // ========================================================================

    /// Query the device inventory via nvidia-smi. Empty on hosts without it.
    pub fn inventory(&self) -> Vec<DeviceInfo> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free,memory.used,utilization.gpu,temperature.gpu",
                "--format=csv,nounits,noheader",
            ])
            .output();

        match output {
            Ok(out) if out.status.success() => {
                parse_inventory(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!(status = %out.status, "nvidia-smi returned non-zero status");
                vec![]
            }
            Err(err) => {
                warn!(error = %err, "nvidia-smi not available");
                vec![]
            }
        }
    }

    /// Temperatures by device index
    pub fn temperatures(&self) -> HashMap<usize, u32> {
        self.inventory()
            .into_iter()
            .map(|d| (d.index, d.temperature_c))
            .collect()
    }

    /// Device with the most free memory above the floor
    pub fn best(&self, min_free_mb: u64) -> Option<usize> {
        self.inventory()
            .into_iter()
            .filter(|d| d.free_memory_mb >= min_free_mb)
            .max_by_key(|d| d.free_memory_mb)
            .map(|d| d.index)
    }

    /// All devices with enough free memory and an acceptable temperature,
    /// sorted by free memory descending
    pub fn free(&self, min_free_mb: u64, max_temp: u32) -> Vec<usize> {
        let mut suitable: Vec<DeviceInfo> = self
            .inventory()
            .into_iter()
            .filter(|d| {
                if d.free_memory_mb < min_free_mb {
                    return false;
                }
                // temperature 0 means no sensor data
                if d.temperature_c != 0 && d.temperature_c > max_temp {
                    warn!(index = d.index, temp = d.temperature_c, "device too hot, skipping");
                    return false;
                }
                true
            })
            .collect();
        suitable.sort_by(|a, b| b.free_memory_mb.cmp(&a.free_memory_mb));
        suitable.into_iter().map(|d| d.index).collect()
    }

    /// Coolest device with enough free memory
    pub fn coolest(&self, min_free_mb: u64) -> Option<usize> {
        self.inventory()
            .into_iter()
            .filter(|d| d.free_memory_mb >= min_free_mb)
            .min_by_key(|d| if d.temperature_c == 0 { 100 } else { d.temperature_c })
            .map(|d| d.index)
    }

    /// Poll until the device temperature drops to `max_temp` or timeout
    pub fn wait_for_cooldown(&self, index: usize, max_temp: u32, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let temp = self.temperatures().get(&index).copied().unwrap_or(0);
            if temp == 0 || temp <= max_temp {
                info!(index, temp, "device cool enough");
                return true;
            }
            info!(index, temp, "device still too hot, waiting");
            std::thread::sleep(Duration::from_secs(5));
        }
        warn!(index, "cooldown wait timed out");
        false
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Ask the LLM runtime to unload its resident models. Best-effort.
    pub fn unload_llm_models(&self) {
        for model in &self.llm_models {
            match Command::new("ollama").args(["stop", model]).output() {
                Ok(out) if out.status.success() => info!(model, "stopped LLM model"),
                Ok(_) => {} // model was not running
                Err(err) => {
                    warn!(error = %err, "ollama CLI not found");
                    break;
                }
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    /// Free framework caches via the registered hook. Best-effort.
    pub fn cleanup_framework(&self) {
        if let Some(hook) = self.framework_cleanup.read().unwrap().as_ref() {
            hook();
        }
    }

    /// Both sides: unload LLM models and free framework caches
    pub fn full_cleanup(&self) {
        info!("full GPU cleanup starting");
        self.unload_llm_models();
        self.cleanup_framework();
    }

    // ========================================================================
    // Acquire / release
    // ========================================================================

    /// Acquire the manager for a task. A switch between LLM and framework
    /// families triggers the matching cleanup before the task starts;
    /// cleanup failures never fail the acquisition.
    pub fn acquire(&self, kind: TaskKind, doc_id: Option<&str>) {
        let mut state = self.state.lock().unwrap();

        if let Some(last) = state.last_kind {
            if last.is_llm() && kind.is_framework() {
                info!("task switch llm -> framework, unloading LLM models");
                self.unload_llm_models();
            } else if last.is_framework() && kind.is_llm() {
                info!("task switch framework -> llm, freeing framework caches");
                self.cleanup_framework();
            }
        }

        let device_indices = if kind.is_framework() {
            self.best(2000).map(|i| vec![i]).unwrap_or_default()
        } else if kind.is_llm() {
            // The LLM runtime manages its own placement
            self.inventory().into_iter().map(|d| d.index).collect()
        } else {
            vec![]
        };

        state.current = Some(CurrentTask {
            kind,
            doc_id: doc_id.map(str::to_string),
            started_at: Utc::now(),
            device_indices,
        });
        state.last_kind = Some(kind);
        info!(task = kind.as_str(), doc_id = doc_id.unwrap_or(""), "GPU manager acquired");
    }

    /// Release after a task; optionally free framework caches
    pub fn release(&self, cleanup_after: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.current.take() {
            let duration = Utc::now() - task.started_at;
            info!(
                task = task.kind.as_str(),
                doc_id = task.doc_id.as_deref().unwrap_or(""),
                duration_secs = duration.num_seconds(),
                "GPU manager released"
            );
        }
        drop(state);
        if cleanup_after {
            self.cleanup_framework();
        }
    }

    pub fn current(&self) -> Option<CurrentTask> {
        self.state.lock().unwrap().current.clone()
    }

    /// Full status snapshot for the HTTP surface
    pub fn status(&self) -> Value {
        let devices = self.inventory();
        let current = self.current();
        json!({
            "gpu_count": devices.len(),
            "gpus": devices,
            "current_task": {
                "type": current.as_ref().map(|t| t.kind.as_str()).unwrap_or("idle"),
                "doc_id": current.as_ref().and_then(|t| t.doc_id.clone()),
                "started_at": current.as_ref().map(|t| t.started_at.to_rfc3339()),
                "gpu_indices": current.as_ref().map(|t| t.device_indices.clone()).unwrap_or_default(),
            },
        })
    }
}

/// Parse nvidia-smi CSV output (index,name,total,free,used,util,temp)
fn parse_inventory(csv: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for line in csv.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 7 {
            continue;
        }
        let parse_u64 = |s: &str| s.parse::<u64>().unwrap_or(0);
        let parse_u32 = |s: &str| s.parse::<u32>().unwrap_or(0);
        if let Ok(index) = parts[0].parse::<usize>() {
            devices.push(DeviceInfo {
                index,
                name: parts[1].to_string(),
                total_memory_mb: parse_u64(parts[2]),
                free_memory_mb: parse_u64(parts[3]),
                used_memory_mb: parse_u64(parts[4]),
                utilization_pct: parse_u32(parts[5]),
                temperature_c: parse_u32(parts[6]),
            });
        }
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SAMPLE_CSV: &str = "\
0, NVIDIA GeForce RTX 3060 Ti, 8192, 6000, 2192, 15, 55
1, NVIDIA GeForce RTX 3060 Ti, 8192, 1000, 7192, 90, 82
2, NVIDIA GeForce RTX 3060 Ti, 8192, 7500, 692, 5, 40
";

    #[test]
    fn test_parse_inventory() {
        let devices = parse_inventory(SAMPLE_CSV);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].free_memory_mb, 6000);
        assert_eq!(devices[1].temperature_c, 82);
        assert_eq!(devices[2].utilization_pct, 5);
    }

    #[test]
    fn test_parse_inventory_skips_garbage() {
        let devices = parse_inventory("garbage line\n\n0, Card, 8192, 100, 8092, 1, 50\n");
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn test_task_kind_families() {
        assert!(TaskKind::OllamaAnalysis.is_llm());
        assert!(TaskKind::OllamaEnrichment.is_llm());
        assert!(TaskKind::PytorchEmbedding.is_framework());
        assert!(TaskKind::PytorchReranking.is_framework());
        assert!(!TaskKind::Idle.is_llm());
        assert!(!TaskKind::Idle.is_framework());
    }

    #[test]
    fn test_acquire_release_tracks_current() {
        let manager = GpuTaskManager::new(vec![]);
        assert!(manager.current().is_none());

        manager.acquire(TaskKind::PytorchEmbedding, Some("doc1"));
        let current = manager.current().unwrap();
        assert_eq!(current.kind, TaskKind::PytorchEmbedding);
        assert_eq!(current.doc_id.as_deref(), Some("doc1"));

        manager.release(false);
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_framework_cleanup_hook_runs_on_family_switch() {
        let manager = GpuTaskManager::new(vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.set_framework_cleanup(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // framework -> llm switch fires the framework cleanup
        manager.acquire(TaskKind::PytorchEmbedding, None);
        manager.release(false);
        manager.acquire(TaskKind::OllamaEnrichment, None);
        manager.release(false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_with_cleanup_after() {
        let manager = GpuTaskManager::new(vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.set_framework_cleanup(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.acquire(TaskKind::PytorchReranking, None);
        manager.release(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_shape() {
        let manager = GpuTaskManager::new(vec![]);
        let status = manager.status();
        assert!(status.get("gpu_count").is_some());
        assert_eq!(status["current_task"]["type"], "idle");
    }
}
