//! Local embeddings using Candle (pure Rust)
//!
//! The pipeline only depends on the `Encoder` interface: a batch of texts in,
//! an L2-normalized matrix out. The default implementation is a BERT-style
//! model with mean pooling, loaded from the HuggingFace hub.
//!
//! GPU acceleration is available via feature flags:
//! - `metal` - Apple Silicon GPU (macOS)
//! - `cuda` - NVIDIA GPU

use crate::config::{DevicePreference, EmbeddingSettings};
use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use tokenizers::Tokenizer;

/// Batch encoder producing L2-normalized embeddings
pub trait Encoder: Send + Sync {
    /// Encode a batch of texts into a row-per-text matrix. Rows are
    /// L2-normalized so inner product equals cosine similarity.
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimension of this encoder
    fn dimension(&self) -> usize;

    /// Model identifier recorded on documents and chunks
    fn model_id(&self) -> &str;
}

/// Resolve the compute device based on preference and available features
pub fn resolve_device(preference: &DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0).context("Failed to initialize Metal device")
            }
            #[cfg(not(feature = "metal"))]
            {
                anyhow::bail!("Metal support not compiled in. Rebuild with: cargo build --features metal")
            }
        }

        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0).context("Failed to initialize CUDA device")
            }
            #[cfg(not(feature = "cuda"))]
            {
                anyhow::bail!("CUDA support not compiled in. Rebuild with: cargo build --features cuda")
            }
        }

        DevicePreference::Auto => {
            #[cfg(feature = "metal")]
            if let Ok(device) = Device::new_metal(0) {
                return Ok(device);
            }

            #[cfg(feature = "cuda")]
            if let Ok(device) = Device::new_cuda(0) {
                return Ok(device);
            }

            Ok(Device::Cpu)
        }
    }
}

/// Device for a specific accelerator index; CPU when CUDA is not compiled in
pub fn device_for_index(index: usize) -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(index).with_context(|| format!("Failed to initialize CUDA device {}", index))
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = index;
        Ok(Device::Cpu)
    }
}

/// BERT-style encoder with mean pooling
pub struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
    model_id: String,
}

impl BertEncoder {
    /// Load the configured model onto the preferred device
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let device = resolve_device(&settings.device)?;
        Self::load(&settings.model_name, settings.dimension, device)
    }

    /// Load the model onto a specific device (used by the parallel embedder)
    pub fn load(model_id: &str, dimension: usize, device: Device) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo.get("config.json").context("Failed to get config.json")?;
        let tokenizer_path = repo.get("tokenizer.json").context("Failed to get tokenizer.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to get model.safetensors")?;

        let config_str = std::fs::read_to_string(&config_path)?;
        let bert_config: BertConfig = serde_json::from_str(&config_str)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? };
        let model = BertModel::load(vb, &bert_config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
            model_id: model_id.to_string(),
        })
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // BERT position embeddings cap the sequence length at 512
        const MAX_SEQ_LEN: usize = 512;

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let batch = encodings.len();
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .min(MAX_SEQ_LEN);

        // Flat row-major buffers, zero-padded to seq_len. The mask marks the
        // real tokens of each row; token type ids stay zero because every
        // input is single-segment.
        let mut ids = vec![0u32; batch * seq_len];
        let mut mask = vec![0u32; batch * seq_len];
        for (row, encoding) in encodings.iter().enumerate() {
            let token_ids = encoding.get_ids();
            let take = token_ids.len().min(seq_len);
            let offset = row * seq_len;
            ids[offset..offset + take].copy_from_slice(&token_ids[..take]);
            for slot in mask[offset..offset + take].iter_mut() {
                *slot = 1;
            }
        }

        let input_ids = Tensor::from_vec(ids, (batch, seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (batch, seq_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let pooled = mean_pool_normalize(&hidden, &attention_mask)?;
        Ok(pooled.to_vec2()?)
    }
}

/// Masked mean pooling over the sequence dimension followed by L2
/// normalization. This is the standard sentence-embedding readout every
/// BERT-style encoder shares; there is nothing service-specific to vary here.
fn mean_pool_normalize(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(DTYPE)?;
    let expanded = mask.unsqueeze(2)?.broadcast_as(hidden.shape())?;
    let summed = hidden.mul(&expanded)?.sum(1)?;
    let token_counts = mask.sum(1)?.unsqueeze(1)?;
    // divide as reciprocal multiply; broadcast_div misbehaves on Metal
    let mean = summed.broadcast_mul(&token_counts.recip()?)?;

    let norms = mean.sqr()?.sum(1)?.sqrt()?.unsqueeze(1)?;
    Ok(mean.broadcast_mul(&norms.recip()?)?)
}

impl Encoder for BertEncoder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.encode_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
