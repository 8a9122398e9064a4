//! Contextual enrichment
//!
//! Prepends a short LLM-generated context line to each chunk before it is
//! embedded, which improves recall for fine-grained chunks. Failures degrade
//! per chunk to a metadata-only prefix; the batch itself never fails, and the
//! whole feature sits behind a global kill switch.

use crate::config::{ContextSettings, LlmSettings};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const CONTEXT_SYSTEM_PROMPT: &str = "\
Je bent een document-context expert. Je taak is om in 1-2 zinnen de context en relevantie van een tekstpassage te beschrijven.

Regels:
- Maximaal 2 zinnen
- Beschrijf WAT de passage behandelt
- Noem relevante entiteiten of cijfers
- Gebruik dezelfde taal als de input (Nederlands of Engels)
- Geef ALLEEN de contextbeschrijving, geen uitleg of commentaar";

/// Maximum chunk characters forwarded to the context model
const CONTEXT_INPUT_CAP: usize = 1500;

/// Document-level hints handed to the context model
#[derive(Debug, Clone, Default)]
pub struct DocContext {
    pub filename: String,
    pub document_type: String,
    pub main_topics: Vec<String>,
    pub main_entities: Vec<String>,
}

impl DocContext {
    /// Pull hints out of opaque document metadata
    pub fn from_metadata(doc_id: &str, document_type: &str, metadata: &Value) -> Self {
        let str_list = |key: &str| -> Vec<String> {
            metadata
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            filename: metadata
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or(doc_id)
                .to_string(),
            document_type: document_type.to_string(),
            main_topics: str_list("main_topics"),
            main_entities: str_list("main_entities"),
        }
    }
}

/// LLM-backed chunk enricher with bounded parallelism
pub struct ContextEnricher {
    settings: ContextSettings,
    llm: LlmSettings,
    client: reqwest::blocking::Client,
}

impl ContextEnricher {
    pub fn new(settings: ContextSettings, llm: LlmSettings) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { settings, llm, client }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Assemble the enriched text: metadata prefix, optional LLM context,
    /// blank line, original chunk
    pub fn format_enriched(chunk: &str, context: Option<&str>, meta: &DocContext) -> String {
        let mut parts = Vec::new();
        if !meta.filename.is_empty() {
            parts.push(format!("[Document: {}]", meta.filename));
        }
        if !meta.document_type.is_empty() {
            parts.push(format!("[Type: {}]", meta.document_type));
        }
        if let Some(context) = context {
            parts.push(format!("[Context: {}]", context));
        }
        parts.push(String::new());
        parts.push(chunk.to_string());
        parts.join("\n")
    }

    /// One LLM call for one chunk. None on any failure.
    fn generate_context(&self, chunk: &str, meta: &DocContext, worker_id: usize) -> Option<String> {
        let topics = if meta.main_topics.is_empty() {
            "niet gespecificeerd".to_string()
        } else {
            meta.main_topics.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        };
        let entities = if meta.main_entities.is_empty() {
            "niet gespecificeerd".to_string()
        } else {
            meta.main_entities.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        };
        let capped: String = chunk.chars().take(CONTEXT_INPUT_CAP).collect();

        let user_prompt = format!(
            "Document informatie:\n- Bestand: {}\n- Type: {}\n- Onderwerpen: {}\n- Entiteiten: {}\n\n\
             Passage:\n\"\"\"{}\"\"\"\n\n\
             Beschrijf de context van deze passage in 1-2 zinnen:",
            meta.filename, meta.document_type, topics, entities, capped
        );

        let payload = json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": CONTEXT_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
            "keep_alive": "30m",
            "options": {"temperature": 0.1, "num_predict": 150},
        });

        let url = format!("{}/api/chat", self.llm.url_for_device(worker_id));
        let result: Result<String> = (|| {
            let resp = self.client.post(&url).json(&payload).send()?.error_for_status()?;
            let body: Value = resp.json()?;
            let content = body["message"]["content"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing message content"))?;
            Ok(content.trim().to_string())
        })();

        match result {
            Ok(content) if !content.is_empty() => Some(content),
            Ok(_) => None,
            Err(err) => {
                warn!(worker_id, error = %err, "context generation failed");
                None
            }
        }
    }

    /// Enrich a batch of chunks. Output length and order equal the input.
    /// With the feature disabled, only the metadata prefix is applied.
    pub fn enrich_batch(&self, chunks: &[String], meta: &DocContext) -> Vec<String> {
        if chunks.is_empty() {
            return vec![];
        }
        if !self.settings.enabled {
            return chunks
                .iter()
                .map(|chunk| Self::format_enriched(chunk, None, meta))
                .collect();
        }

        let worker_count = self.settings.max_workers.max(1).min(chunks.len());
        let results: Mutex<Vec<Option<String>>> = Mutex::new(vec![None; chunks.len()]);
        let next = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker_id in 0..worker_count {
                let results = &results;
                let next = &next;
                scope.spawn(move || loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= chunks.len() {
                        break;
                    }
                    let context = self.generate_context(&chunks[idx], meta, worker_id);
                    let enriched = Self::format_enriched(&chunks[idx], context.as_deref(), meta);
                    results.lock().unwrap()[idx] = Some(enriched);
                    debug!(idx, worker_id, "chunk enriched");
                });
            }
        });

        results
            .into_inner()
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(idx, enriched)| {
                // A panicked worker leaves a hole; degrade to metadata-only
                enriched.unwrap_or_else(|| Self::format_enriched(&chunks[idx], None, meta))
            })
            .collect()
    }
}
