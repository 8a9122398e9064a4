//! Document analyzer
//!
//! Extracts entities, topics, domain and document type from a document via
//! chat-style LLM endpoints. Large documents are split into page batches and
//! fanned out over device-pinned endpoints; each batch call holds the global
//! GPU phase lock, batch JSON output is parsed tolerantly, and the partial
//! results are aggregated with majority voting.

pub mod jobs;

use crate::config::{AnalyzerSettings, LlmSettings};
use crate::gpu::GpuTaskManager;
use crate::lock::PhaseLock;
use crate::status::{Stage, StatusReporter, StatusUpdate};
use crate::types::DocumentAnalysis;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

static PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[PAGE \d+\]").unwrap());

/// Paragraph window size when no page markers exist
const FALLBACK_WINDOW_CHARS: usize = 2000;
/// Characters of batch text forwarded to the LLM
const BATCH_PROMPT_CAP: usize = 8000;
/// Caps on aggregated lists
const MAX_ENTITIES: usize = 10;
const MAX_TOPICS: usize = 10;
const MAX_ERRORS: usize = 5;

/// Analysis of one page batch
#[derive(Debug, Clone, Default)]
pub struct PartialAnalysis {
    pub page_range: String,
    pub device_index: usize,
    pub duration_sec: f64,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub domain: String,
    pub document_type: String,
    pub has_tables: bool,
    pub error: Option<String>,
}

/// Whether a document is large enough for parallel analysis
pub fn should_use_parallel(text: &str, settings: &AnalyzerSettings) -> bool {
    let size_mb = text.len() as f64 / (1024.0 * 1024.0);
    if size_mb > settings.size_threshold_mb {
        info!(size_mb, "document above size threshold, using parallel analysis");
        return true;
    }
    let page_count = PAGE_MARKER.find_iter(text).count();
    if page_count > settings.page_threshold {
        info!(page_count, "document above page threshold, using parallel analysis");
        return true;
    }
    false
}

/// Split on `[PAGE n]` markers; without markers, group paragraphs into
/// ~2 KiB windows
pub fn split_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = PAGE_MARKER
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if !pages.is_empty() {
        return pages;
    }

    let mut windows = Vec::new();
    let mut current = String::new();
    for para in text.split("\n\n") {
        if !current.is_empty() && current.len() + para.len() > FALLBACK_WINDOW_CHARS {
            windows.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.trim().is_empty() {
        windows.push(current);
    }
    windows
}

/// Group pages into batches of `batch_size`
pub fn page_batches(pages: Vec<String>, batch_size: usize) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    pages
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Find the first balanced JSON object in LLM output
pub fn extract_first_json(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &raw[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn most_common(items: &[String], default: &str) -> String {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for item in items {
        *counts.entry(item.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(item, _)| item.to_string())
        .unwrap_or_else(|| default.to_string())
}

fn dedup_capped(items: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .take(cap)
        .collect()
}

/// Chunk strategy suggested by the analysis outcome
pub fn choose_strategy(document_type: &str, has_tables: bool) -> &'static str {
    match document_type {
        "jaarrekening" | "annual_report" | "financieel_rapport" => "page_plus_table_aware",
        "offerte" | "aanbieding" | "contract" => "semantic_sections",
        _ if has_tables => "table_aware",
        _ => "default",
    }
}

/// LLM-backed analyzer with parallel fan-out for large documents
pub struct DocumentAnalyzer {
    settings: AnalyzerSettings,
    llm: LlmSettings,
    gpu: Arc<GpuTaskManager>,
    phase_lock: Option<PhaseLock>,
    reporter: StatusReporter,
    embed_model: String,
    client: reqwest::blocking::Client,
}

impl DocumentAnalyzer {
    pub fn new(
        settings: AnalyzerSettings,
        llm: LlmSettings,
        gpu: Arc<GpuTaskManager>,
        phase_lock: Option<PhaseLock>,
        reporter: StatusReporter,
        embed_model: String,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            settings,
            llm,
            gpu,
            phase_lock,
            reporter,
            embed_model,
            client,
        }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Analyze a document, choosing parallel fan-out when the size warrants it
    pub fn analyze(
        &self,
        text: &str,
        filename: Option<&str>,
        mime_type: Option<&str>,
        doc_id: Option<&str>,
        force_parallel: bool,
    ) -> Result<DocumentAnalysis> {
        if force_parallel || should_use_parallel(text, &self.settings) {
            self.analyze_parallel(text, filename, mime_type, doc_id)
        } else {
            // Single batch covering the whole document
            let partial = self.analyze_batch(std::slice::from_ref(&text.to_string()), 0, 0, filename);
            let mut analysis = self.aggregate(vec![partial], filename, mime_type);
            analysis.extra["parallel_analysis"] = Value::Bool(false);
            Ok(analysis)
        }
    }

    /// Fan a large document out over the available devices
    pub fn analyze_parallel(
        &self,
        text: &str,
        filename: Option<&str>,
        mime_type: Option<&str>,
        doc_id: Option<&str>,
    ) -> Result<DocumentAnalysis> {
        let start = Instant::now();
        if let Some(doc_id) = doc_id {
            self.reporter.emit(
                StatusUpdate::new(doc_id, Stage::Analyzing)
                    .progress(5)
                    .message(format!("Starting parallel analysis ({})", self.llm.model))
                    .metadata(json!({"model": self.llm.model, "multi_device": self.llm.multi_device})),
            );
        }

        let pages = split_pages(text);
        let batches = page_batches(pages, self.settings.pages_per_batch);
        if batches.is_empty() {
            return Ok(self.aggregate(vec![], filename, mime_type));
        }

        // Device pool: free devices, else wait on the coolest, else device 0
        let mut devices = self
            .gpu
            .free(self.settings.min_free_mb, self.settings.max_temp_c);
        if devices.is_empty() {
            warn!("no free devices, waiting for cooldown");
            if let Some(coolest) = self.gpu.coolest(self.settings.min_free_mb) {
                self.gpu
                    .wait_for_cooldown(coolest, self.settings.max_temp_c, Duration::from_secs(60));
                devices = vec![coolest];
            } else {
                devices = vec![0];
            }
        }

        let max_workers = batches.len().min(devices.len()).max(1);
        info!(
            batches = batches.len(),
            devices = devices.len(),
            max_workers,
            "dispatching analysis batches"
        );
        if let Some(doc_id) = doc_id {
            self.reporter.emit(
                StatusUpdate::new(doc_id, Stage::Analyzing)
                    .progress(10)
                    .message(format!(
                        "Analyzing {} batches over {} devices",
                        batches.len(),
                        max_workers
                    ))
                    .metadata(json!({"batches": batches.len(), "devices_used": max_workers})),
            );
        }

        // Bounded fan-out: `max_workers` threads pull batch indices from a
        // shared counter; each batch is pinned round-robin to a device
        let total_batches = batches.len();
        let partials: Mutex<Vec<Option<PartialAnalysis>>> = Mutex::new(vec![None; total_batches]);
        let next = std::sync::atomic::AtomicUsize::new(0);
        let done = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..max_workers {
                let partials = &partials;
                let next = &next;
                let done = &done;
                let devices = &devices;
                let batches = &batches;
                scope.spawn(move || loop {
                    let batch_idx = next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if batch_idx >= total_batches {
                        break;
                    }
                    let device = devices[batch_idx % devices.len()];
                    let partial = self.analyze_batch(&batches[batch_idx], batch_idx, device, filename);
                    partials.lock().unwrap()[batch_idx] = Some(partial);

                    let finished = done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    if let Some(doc_id) = doc_id {
                        let progress = 10 + (finished * 80 / total_batches) as u8;
                        self.reporter.emit(
                            StatusUpdate::new(doc_id, Stage::Analyzing)
                                .progress(progress)
                                .message(format!("Batch {}/{} done (device {})", finished, total_batches, device)),
                        );
                    }
                });
            }
        });

        let partials: Vec<PartialAnalysis> = partials
            .into_inner()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        let failed = partials.iter().filter(|p| p.error.is_some()).count();

        let mut analysis = self.aggregate(partials, filename, mime_type);
        analysis.extra["total_parallel_duration"] =
            json!((start.elapsed().as_secs_f64() * 100.0).round() / 100.0);

        // Mass failure: clean the devices and surface a failed status, but
        // still hand back what was aggregated
        if failed * 2 > total_batches {
            warn!(failed, total_batches, "high analysis failure rate, cleaning devices");
            self.gpu.full_cleanup();
            if let Some(doc_id) = doc_id {
                self.reporter.failed(
                    doc_id,
                    &format!("Too many batch failures: {}/{}", failed, total_batches),
                    "parallel_analysis",
                );
            }
        }
        Ok(analysis)
    }

    /// One LLM call for one batch of pages
    fn analyze_batch(
        &self,
        batch: &[String],
        batch_index: usize,
        device_index: usize,
        filename: Option<&str>,
    ) -> PartialAnalysis {
        let start = Instant::now();
        let page_start = batch_index * self.settings.pages_per_batch + 1;
        let page_end = page_start + batch.len().saturating_sub(1);
        let page_range = format!("{}-{}", page_start, page_end);

        let combined: String = batch
            .join("\n\n---\n\n")
            .chars()
            .take(BATCH_PROMPT_CAP)
            .collect();

        let payload = json!({
            "model": self.llm.model,
            "messages": [
                {
                    "role": "system",
                    "content": "Je bent een document-analyzer. Analyseer de gegeven tekst en geef een JSON met:\n\
                                - entities: lijst van max 5 belangrijke entiteiten (namen/organisaties)\n\
                                - topics: lijst van max 5 onderwerpen\n\
                                - domain: kort domeinwoord (finance, sales, legal, tech, general)\n\
                                - document_type: type document (jaarrekening, offerte, rapport, etc.)\n\
                                - has_tables: true/false\n\
                                Antwoord ALLEEN met JSON."
                },
                {
                    "role": "user",
                    "content": format!(
                        "Bestandsnaam: {}\nPagina's: {}\n\nTEKST:\n{}\n\nGeef JSON analyse:",
                        filename.unwrap_or("onbekend"), page_range, combined
                    )
                }
            ],
            "stream": false,
            "keep_alive": "0",
            "options": {"temperature": 0.1},
        });

        let call = || -> Result<Value> {
            // Global GPU exclusivity across the whole service for LLM batches
            let _guard = match &self.phase_lock {
                Some(lock) => Some(lock.acquire_with_timeout(
                    "llm_parallel_batch",
                    filename,
                    Duration::from_secs(3600),
                )?),
                None => None,
            };
            let url = format!("{}/api/chat", self.llm.url_for_device(device_index));
            let resp = self.client.post(&url).json(&payload).send()?.error_for_status()?;
            let body: Value = resp.json()?;
            let content = body["message"]["content"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("missing message content"))?;
            Ok(extract_first_json(content).unwrap_or_else(|| json!({})))
        };

        match call() {
            Ok(parsed) => {
                let str_list = |key: &str| -> Vec<String> {
                    parsed
                        .get(key)
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .take(5)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default()
                };
                PartialAnalysis {
                    page_range,
                    device_index,
                    duration_sec: start.elapsed().as_secs_f64(),
                    entities: str_list("entities"),
                    topics: str_list("topics"),
                    domain: parsed
                        .get("domain")
                        .and_then(Value::as_str)
                        .unwrap_or("general")
                        .to_string(),
                    document_type: parsed
                        .get("document_type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    has_tables: parsed.get("has_tables").and_then(Value::as_bool).unwrap_or(false),
                    error: None,
                }
            }
            Err(err) => {
                warn!(batch_index, error = %err, "analysis batch failed");
                PartialAnalysis {
                    page_range,
                    device_index,
                    duration_sec: start.elapsed().as_secs_f64(),
                    error: Some(err.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Combine partial analyses: union entities/topics, majority vote on
    /// domain and document type, OR on table presence, summed durations
    fn aggregate(
        &self,
        partials: Vec<PartialAnalysis>,
        filename: Option<&str>,
        mime_type: Option<&str>,
    ) -> DocumentAnalysis {
        let mut entities = Vec::new();
        let mut topics = Vec::new();
        let mut domains = Vec::new();
        let mut doc_types = Vec::new();
        let mut has_tables = false;
        let mut total_duration = 0.0;
        let mut errors = Vec::new();

        for partial in &partials {
            if let Some(error) = &partial.error {
                errors.push(format!("{}: {}", partial.page_range, error));
                continue;
            }
            entities.extend(partial.entities.clone());
            topics.extend(partial.topics.clone());
            if !partial.domain.is_empty() {
                domains.push(partial.domain.clone());
            }
            if !partial.document_type.is_empty() {
                doc_types.push(partial.document_type.clone());
            }
            has_tables |= partial.has_tables;
            total_duration += partial.duration_sec;
        }

        let entities = dedup_capped(entities, MAX_ENTITIES);
        let topics = dedup_capped(topics, MAX_TOPICS);
        let domain = most_common(&domains, "general");
        let document_type = most_common(&doc_types, "document");
        let strategy = choose_strategy(&document_type, has_tables);

        let processed = partials.iter().filter(|p| p.error.is_none()).count();
        let mut extra = json!({
            "parallel_analysis": true,
            "batches_processed": processed,
            "batches_failed": errors.len(),
            "total_duration_sec": (total_duration * 100.0).round() / 100.0,
            "domain": domain,
        });
        if !errors.is_empty() {
            errors.truncate(MAX_ERRORS);
            extra["errors"] = json!(errors);
        }
        let _ = filename;

        DocumentAnalysis {
            document_type,
            mime_type: mime_type.map(str::to_string),
            language: "nl".to_string(),
            page_count: partials.len() * self.settings.pages_per_batch,
            has_tables,
            has_images: false,
            main_entities: entities,
            main_topics: topics,
            suggested_chunk_strategy: strategy.to_string(),
            suggested_embed_model: self.embed_model.clone(),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AnalyzerSettings {
        AnalyzerSettings::default()
    }

    #[test]
    fn test_should_use_parallel_by_size() {
        let small = "short document";
        assert!(!should_use_parallel(small, &settings()));

        let big = "x".repeat(4 * 1024 * 1024);
        assert!(should_use_parallel(&big, &settings()));
    }

    #[test]
    fn test_should_use_parallel_by_page_count() {
        let many_pages: String = (1..=80).map(|i| format!("[PAGE {}]\ncontent\n", i)).collect();
        assert!(should_use_parallel(&many_pages, &settings()));

        let few_pages: String = (1..=10).map(|i| format!("[PAGE {}]\ncontent\n", i)).collect();
        assert!(!should_use_parallel(&few_pages, &settings()));
    }

    #[test]
    fn test_split_pages_on_markers() {
        let text = "[PAGE 1]\nfirst\n[PAGE 2]\nsecond\n[PAGE 3]\nthird";
        let pages = split_pages(text);
        assert_eq!(pages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_split_pages_fallback_windows() {
        let paras: String = (0..10)
            .map(|i| format!("{} {}\n\n", "word".repeat(100), i))
            .collect();
        let pages = split_pages(&paras);
        assert!(pages.len() > 1);
        for page in &pages {
            assert!(page.len() <= FALLBACK_WINDOW_CHARS + 600);
        }
    }

    #[test]
    fn test_page_batches() {
        let pages: Vec<String> = (0..12).map(|i| format!("page {}", i)).collect();
        let batches = page_batches(pages, 5);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn test_extract_first_json_plain() {
        let parsed = extract_first_json(r#"{"domain": "finance", "has_tables": true}"#).unwrap();
        assert_eq!(parsed["domain"], "finance");
    }

    #[test]
    fn test_extract_first_json_with_prose_around() {
        let raw = "Hier is de analyse:\n{\"domain\": \"legal\", \"entities\": [\"Acme\"]}\nKlaar!";
        let parsed = extract_first_json(raw).unwrap();
        assert_eq!(parsed["domain"], "legal");
    }

    #[test]
    fn test_extract_first_json_nested_and_strings_with_braces() {
        let raw = r#"noise {"a": {"b": 1}, "s": "curly } inside"} trailing"#;
        let parsed = extract_first_json(raw).unwrap();
        assert_eq!(parsed["a"]["b"], 1);
        assert_eq!(parsed["s"], "curly } inside");
    }

    #[test]
    fn test_extract_first_json_garbage() {
        assert!(extract_first_json("no json here").is_none());
        assert!(extract_first_json("{unbalanced").is_none());
    }

    #[test]
    fn test_most_common_majority() {
        let items = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(most_common(&items, "x"), "a");
        assert_eq!(most_common(&[], "fallback"), "fallback");
    }

    #[test]
    fn test_dedup_capped_preserves_first_occurrence() {
        let items = vec![
            "x".to_string(),
            "y".to_string(),
            "x".to_string(),
            "z".to_string(),
        ];
        assert_eq!(dedup_capped(items, 2), vec!["x", "y"]);
    }

    #[test]
    fn test_choose_strategy() {
        assert_eq!(choose_strategy("jaarrekening", false), "page_plus_table_aware");
        assert_eq!(choose_strategy("offerte", false), "semantic_sections");
        assert_eq!(choose_strategy("rapport", true), "table_aware");
        assert_eq!(choose_strategy("rapport", false), "default");
    }

    #[test]
    fn test_aggregate_votes_and_unions() {
        let analyzer = DocumentAnalyzer::new(
            settings(),
            LlmSettings::default(),
            Arc::new(GpuTaskManager::new(vec![])),
            None,
            StatusReporter::disabled(),
            "BAAI/bge-m3".to_string(),
        );
        let partials = vec![
            PartialAnalysis {
                page_range: "1-5".into(),
                entities: vec!["Acme".into(), "Bolt".into()],
                topics: vec!["finance".into()],
                domain: "finance".into(),
                document_type: "jaarrekening".into(),
                has_tables: true,
                duration_sec: 1.5,
                ..Default::default()
            },
            PartialAnalysis {
                page_range: "6-10".into(),
                entities: vec!["Acme".into()],
                topics: vec!["balans".into()],
                domain: "finance".into(),
                document_type: "rapport".into(),
                duration_sec: 2.0,
                ..Default::default()
            },
            PartialAnalysis {
                page_range: "11-15".into(),
                error: Some("timeout".into()),
                ..Default::default()
            },
        ];
        let analysis = analyzer.aggregate(partials, Some("jaarrekening.pdf"), None);

        assert_eq!(analysis.main_entities, vec!["Acme", "Bolt"]);
        assert!(analysis.has_tables);
        assert_eq!(analysis.extra["domain"], "finance");
        assert_eq!(analysis.extra["batches_processed"], 2);
        assert_eq!(analysis.extra["batches_failed"], 1);
        assert_eq!(analysis.suggested_chunk_strategy, "page_plus_table_aware");
        assert!((analysis.extra["total_duration_sec"].as_f64().unwrap() - 3.5).abs() < 0.01);
        assert!(analysis.extra["errors"].as_array().unwrap()[0]
            .as_str()
            .unwrap()
            .contains("timeout"));
    }
}
