//! Configuration for the silo service
//!
//! Settings are loaded once at startup from an optional `silo.toml` file and
//! then overridden by environment variables. Components receive the settings
//! by reference; nothing reads the environment after startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

/// Device preference for local model compute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Automatically detect best available device (GPU if available, else CPU)
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force Metal GPU (macOS Apple Silicon)
    Metal,
    /// Force CUDA GPU (NVIDIA)
    Cuda,
}

/// Embedding model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// Model identifier recorded on documents and chunks (also the HF repo id)
    pub model_name: String,
    /// Embedding dimension produced by the model
    pub dimension: usize,
    /// Default embedding version applied to new chunks
    pub version: String,
    /// Device preference for the encoder
    #[serde(default)]
    pub device: DevicePreference,
    /// Batch size per device worker
    pub batch_size_per_device: usize,
    /// Maximum number of devices used by the parallel embedder
    pub max_parallel_devices: usize,
    /// Minimum free device memory (MB) required to embed on a device
    pub min_free_mb: u64,
    /// Maximum device temperature (°C) tolerated for embedding
    pub max_temp_c: u32,
    /// Preferred device indices for embedding (tried before the general pool)
    #[serde(default)]
    pub preferred_devices: Vec<usize>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_name: "BAAI/bge-m3".to_string(),
            dimension: 1024,
            version: "BAAI/bge-m3".to_string(),
            device: DevicePreference::Auto,
            batch_size_per_device: 32,
            max_parallel_devices: 6,
            min_free_mb: 2000,
            max_temp_c: 75,
            preferred_devices: vec![],
        }
    }
}

/// Contextual enrichment settings (LLM context prepended before embedding)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    pub enabled: bool,
    pub model: String,
    pub timeout_secs: u64,
    pub max_workers: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "llama3.1:8b".to_string(),
            timeout_secs: 60,
            max_workers: 6,
        }
    }
}

/// Reranker service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankSettings {
    pub enabled: bool,
    /// How many dense candidates to feed the cross-encoder
    pub candidates: usize,
    pub service_url: String,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            candidates: 20,
            service_url: "http://localhost:9200".to_string(),
        }
    }
}

/// LLM endpoint settings (document analysis + enrichment backends)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// One LLM instance per device, on base_port + (device % num_instances)
    pub multi_device: bool,
    pub base_port: u16,
    pub num_instances: u16,
}

impl LlmSettings {
    /// Endpoint for a specific device index (round-robin over instances)
    pub fn url_for_device(&self, device_index: usize) -> String {
        if self.multi_device {
            let port = self.base_port + (device_index as u16 % self.num_instances);
            format!("http://localhost:{}", port)
        } else {
            self.base_url.clone()
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:70b".to_string(),
            timeout_secs: 60,
            multi_device: false,
            base_port: 11434,
            num_instances: 4,
        }
    }
}

/// Parallel analyzer thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    /// Documents larger than this (MiB) are analyzed in parallel
    pub size_threshold_mb: f64,
    /// Documents with more page markers than this are analyzed in parallel
    pub page_threshold: usize,
    pub pages_per_batch: usize,
    pub max_temp_c: u32,
    pub min_free_mb: u64,
    /// Completed/failed analysis jobs older than this are garbage collected
    pub job_max_age_secs: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            size_threshold_mb: 3.0,
            page_threshold: 50,
            pages_per_batch: 5,
            max_temp_c: 75,
            min_free_mb: 6000,
            job_max_age_secs: 3600,
        }
    }
}

/// Cross-process GPU phase lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLockSettings {
    pub path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for PhaseLockSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/ai3_gpu_exclusive.lock"),
            timeout_secs: 900,
        }
    }
}

/// Status webhook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
    pub secret: String,
    pub timeout_secs: f64,
    pub fire_and_forget: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            secret: String::new(),
            timeout_secs: 5.0,
            fire_and_forget: true,
        }
    }
}

/// Hybrid search fusion weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionSettings {
    pub enabled: bool,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub rrf_k: usize,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            rrf_k: 60,
        }
    }
}

/// Top-level service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database path (from `DATABASE_URL`, `sqlite://` prefix stripped)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Directory holding vector index files and the BM25 sidecar
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub rerank: RerankSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
    #[serde(default)]
    pub phase_lock: PhaseLockSettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub fusion: FusionSettings,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./silo.db")
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./indices")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            index_dir: default_index_dir(),
            embedding: EmbeddingSettings::default(),
            context: ContextSettings::default(),
            rerank: RerankSettings::default(),
            llm: LlmSettings::default(),
            analyzer: AnalyzerSettings::default(),
            phase_lock: PhaseLockSettings::default(),
            webhook: WebhookSettings::default(),
            fusion: FusionSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings: optional TOML file, then environment overrides
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            _ => {
                let default_path = Path::new("silo.toml");
                if default_path.exists() {
                    let content = std::fs::read_to_string(default_path)
                        .context("failed to read silo.toml")?;
                    toml::from_str(&content).context("failed to parse silo.toml")?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Override settings from environment variables
    pub fn apply_env(&mut self) {
        if let Some(url) = env_str("DATABASE_URL") {
            // Accept both plain paths and sqlite:// connection strings
            let path = url
                .strip_prefix("sqlite:///")
                .or_else(|| url.strip_prefix("sqlite://"))
                .unwrap_or(&url);
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = env_str("INDEX_DIR") {
            self.index_dir = PathBuf::from(dir);
        }

        if let Some(v) = env_str("EMBED_MODEL_NAME") {
            self.embedding.model_name = v;
        }
        if let Some(v) = env_str("EMBEDDING_VERSION") {
            self.embedding.version = v;
        } else if self.embedding.version.is_empty() {
            self.embedding.version = self.embedding.model_name.clone();
        }
        if let Some(v) = env_parse("BATCH_SIZE_PER_GPU") {
            self.embedding.batch_size_per_device = v;
        }
        if let Some(v) = env_parse("MAX_PARALLEL_GPUS") {
            self.embedding.max_parallel_devices = v;
        }
        if let Some(v) = env_parse("MIN_FREE_MB_FOR_EMBED") {
            self.embedding.min_free_mb = v;
        }
        if let Some(v) = env_parse("MAX_GPU_TEMP_EMBED") {
            self.embedding.max_temp_c = v;
        }

        if let Some(v) = env_bool("CONTEXT_ENABLED") {
            self.context.enabled = v;
        }
        if let Some(v) = env_str("CONTEXT_MODEL") {
            self.context.model = v;
        }
        if let Some(v) = env_parse("CONTEXT_TIMEOUT") {
            self.context.timeout_secs = v;
        }
        if let Some(v) = env_parse("CONTEXT_MAX_WORKERS") {
            self.context.max_workers = v;
        }

        if let Some(v) = env_bool("RERANK_ENABLED") {
            self.rerank.enabled = v;
        }
        if let Some(v) = env_parse("RERANK_CANDIDATES") {
            self.rerank.candidates = v;
        }
        if let Some(v) = env_str("RERANK_SERVICE_URL") {
            self.rerank.service_url = v;
        }

        if let Some(v) = env_str("OLLAMA_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env_str("OLLAMA_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_parse("OLLAMA_TIMEOUT") {
            self.llm.timeout_secs = v;
        }
        if let Some(v) = env_bool("OLLAMA_MULTI_GPU") {
            self.llm.multi_device = v;
        }
        if let Some(v) = env_parse("OLLAMA_BASE_PORT") {
            self.llm.base_port = v;
        }
        if let Some(v) = env_parse("OLLAMA_NUM_INSTANCES") {
            self.llm.num_instances = v;
        }

        if let Some(v) = env_parse("PARALLEL_SIZE_THRESHOLD_MB") {
            self.analyzer.size_threshold_mb = v;
        }
        if let Some(v) = env_parse("PAGES_PER_BATCH") {
            self.analyzer.pages_per_batch = v;
        }
        if let Some(v) = env_parse("MAX_GPU_TEMP") {
            self.analyzer.max_temp_c = v;
        }
        if let Some(v) = env_parse("MIN_FREE_GPU_MB") {
            self.analyzer.min_free_mb = v;
        }

        if let Some(v) = env_str("AI3_GPU_LOCK_PATH") {
            self.phase_lock.path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("AI3_GPU_LOCK_TIMEOUT_SEC") {
            self.phase_lock.timeout_secs = v;
        }

        if let Some(v) = env_str("AI4_WEBHOOK_URL") {
            self.webhook.url = v;
            self.webhook.enabled = true;
        }
        if let Some(v) = env_str("AI4_WEBHOOK_SECRET") {
            self.webhook.secret = v;
        }
        if let Some(v) = env_parse("WEBHOOK_TIMEOUT") {
            self.webhook.timeout_secs = v;
        }
        if let Some(v) = env_bool("WEBHOOK_ENABLED") {
            self.webhook.enabled = v;
        }
        if let Some(v) = env_bool("WEBHOOK_FIRE_AND_FORGET") {
            self.webhook.fire_and_forget = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.rerank.candidates, 20);
        assert_eq!(settings.analyzer.pages_per_batch, 5);
        assert_eq!(settings.fusion.rrf_k, 60);
        assert!((settings.analyzer.size_threshold_mb - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_llm_url_for_device() {
        let llm = LlmSettings {
            multi_device: true,
            base_port: 11434,
            num_instances: 4,
            ..Default::default()
        };
        assert_eq!(llm.url_for_device(0), "http://localhost:11434");
        assert_eq!(llm.url_for_device(3), "http://localhost:11437");
        assert_eq!(llm.url_for_device(5), "http://localhost:11435");

        let single = LlmSettings::default();
        assert_eq!(single.url_for_device(7), "http://localhost:11434");
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = Settings::default();
        let serialized = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.embedding.model_name, settings.embedding.model_name);
        assert_eq!(parsed.rerank.service_url, settings.rerank.service_url);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            index_dir = "/var/lib/silo/indices"

            [rerank]
            enabled = true
            candidates = 40
            service_url = "http://reranker:9200"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.index_dir, PathBuf::from("/var/lib/silo/indices"));
        assert!(parsed.rerank.enabled);
        assert_eq!(parsed.rerank.candidates, 40);
        // Untouched sections keep defaults
        assert_eq!(parsed.analyzer.page_threshold, 50);
    }
}
