//! Content-aware chunking strategies
//!
//! Each strategy scores its own applicability against a sample of the input
//! and the registry picks the best match, so callers can ingest financial
//! reports, legal texts, chat logs and reviews without naming a strategy.
//!
//! Strategies produce plain chunk strings; structural context is carried as
//! inline markers (`[ARTIKEL 3]`, `[TABEL]`, `[PAGE 2]`) so downstream
//! embedding sees it.

pub mod administrative;
pub mod conversation;
pub mod default;
pub mod financial;
pub mod free_text;
pub mod legal;
pub mod menus;
pub mod pages;
pub mod reviews;
pub mod sections;
pub mod tables;

pub use administrative::AdministrativeStrategy;
pub use conversation::ConversationTurnsStrategy;
pub use default::DefaultStrategy;
pub use financial::FinancialTablesStrategy;
pub use free_text::FreeTextStrategy;
pub use legal::LegalStrategy;
pub use menus::MenusStrategy;
pub use pages::PageTableAwareStrategy;
pub use reviews::ReviewsStrategy;
pub use sections::SemanticSectionsStrategy;
pub use tables::TableAwareStrategy;

use crate::error::ServiceError;
use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// How much of the input is inspected during auto-detection
const DETECTION_SAMPLE_CHARS: usize = 2000;

/// Hints passed alongside the text during strategy detection
#[derive(Debug, Clone, Default)]
pub struct StrategyMetadata {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub doc_type: Option<String>,
    pub source: Option<String>,
}

impl StrategyMetadata {
    pub fn with_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Default::default()
        }
    }

    pub(crate) fn filename_lower(&self) -> String {
        self.filename.as_deref().unwrap_or("").to_lowercase()
    }
}

/// Merged chunking configuration handed to a strategy
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub max_chars: usize,
    pub overlap: usize,
    /// Strategy-specific parameters (merged defaults + caller overrides)
    pub extra: Map<String, Value>,
}

impl ChunkConfig {
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self {
            max_chars,
            overlap,
            extra: Map::new(),
        }
    }

    pub fn usize_param(&self, key: &str, default: usize) -> usize {
        self.extra
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn str_param<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.extra.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    /// Build a config from a strategy's defaults with caller overrides merged on top
    fn merged(defaults: &Value, overrides: Option<&Value>) -> Self {
        let mut extra = defaults.as_object().cloned().unwrap_or_default();
        if let Some(Value::Object(caller)) = overrides {
            for (key, value) in caller {
                extra.insert(key.clone(), value.clone());
            }
        }
        let max_chars = extra
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(800);
        let overlap = extra
            .get("overlap")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(0);
        Self { max_chars, overlap, extra }
    }
}

/// A chunking strategy
pub trait ChunkStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Default configuration as a JSON object (`max_chars`, `overlap`, extras)
    fn default_config(&self) -> Value;
    /// Confidence in [0, 1] that this strategy fits the sample
    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32;
    /// Split the full text into chunks; empty output is treated as failure
    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String>;
}

/// Description of a registered strategy for the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub default_config: Value,
}

/// Registry of chunking strategies with auto-detection
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn ChunkStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self { strategies: Vec::new() }
    }

    /// Registry with all built-in strategies registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DefaultStrategy));
        registry.register(Box::new(FreeTextStrategy));
        registry.register(Box::new(PageTableAwareStrategy));
        registry.register(Box::new(SemanticSectionsStrategy));
        registry.register(Box::new(ConversationTurnsStrategy));
        registry.register(Box::new(TableAwareStrategy));
        registry.register(Box::new(FinancialTablesStrategy));
        registry.register(Box::new(LegalStrategy));
        registry.register(Box::new(AdministrativeStrategy));
        registry.register(Box::new(ReviewsStrategy));
        registry.register(Box::new(MenusStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn ChunkStrategy>) {
        debug!(strategy = strategy.name(), "registered chunking strategy");
        self.strategies.push(strategy);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChunkStrategy> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn list(&self) -> Vec<StrategyInfo> {
        self.strategies
            .iter()
            .map(|s| StrategyInfo {
                name: s.name(),
                description: s.description(),
                default_config: s.default_config(),
            })
            .collect()
    }

    /// Pick the strategy with the highest applicability score for this input.
    /// Ties break toward registration order.
    pub fn auto_detect(&self, text: &str, metadata: Option<&StrategyMetadata>) -> Result<&str> {
        if self.strategies.is_empty() {
            return Err(ServiceError::validation("no chunking strategies registered").into());
        }
        let sample: String = text.chars().take(DETECTION_SAMPLE_CHARS).collect();

        let mut best_name = self.strategies[0].name();
        let mut best_score = f32::MIN;
        for strategy in &self.strategies {
            let score = strategy.applicability(&sample, metadata).clamp(0.0, 1.0);
            debug!(strategy = strategy.name(), score, "strategy applicability");
            if score > best_score {
                best_score = score;
                best_name = strategy.name();
            }
        }
        info!(strategy = best_name, score = best_score, "selected chunking strategy");
        Ok(best_name)
    }

    /// Chunk text with the named or auto-detected strategy.
    ///
    /// Caller config is merged over the strategy defaults. A strategy that
    /// produces no chunks for non-empty input counts as failed and falls back
    /// to `default`; if `default` also produces nothing the error surfaces.
    pub fn chunk_text(
        &self,
        text: &str,
        strategy_name: Option<&str>,
        config_overrides: Option<&Value>,
        metadata: Option<&StrategyMetadata>,
    ) -> Result<Vec<String>> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }

        let name = match strategy_name {
            Some(name) => name,
            None => self.auto_detect(text, metadata)?,
        };

        let strategy = match self.get(name) {
            Some(s) => s,
            None => {
                warn!(strategy = name, "unknown chunking strategy, using default");
                self.get("default").ok_or_else(|| {
                    anyhow::Error::from(ServiceError::validation("no default strategy registered"))
                })?
            }
        };

        let config = ChunkConfig::merged(&strategy.default_config(), config_overrides);
        let chunks = clean_chunks(strategy.chunk(text, &config));
        if !chunks.is_empty() {
            return Ok(chunks);
        }

        // Zero chunks for non-empty input: fall back to the default strategy
        if strategy.name() != "default" {
            warn!(strategy = strategy.name(), "strategy produced no chunks, falling back to default");
            if let Some(default) = self.get("default") {
                let config = ChunkConfig::merged(&default.default_config(), config_overrides);
                let chunks = clean_chunks(default.chunk(text, &config));
                if !chunks.is_empty() {
                    return Ok(chunks);
                }
            }
        }
        Err(ServiceError::validation(format!(
            "chunking produced no output (strategy '{}')",
            name
        ))
        .into())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn clean_chunks(chunks: Vec<String>) -> Vec<String> {
    chunks
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

// ============================================================================
// Document type heuristics
// ============================================================================

/// Heuristic document type classification from filename and leading text
pub fn classify_document_type(text: &str, filename: Option<&str>) -> &'static str {
    let fn_lower = filename.unwrap_or("").to_lowercase();
    let head: String = text.chars().take(400).collect::<String>().to_lowercase();

    if fn_lower.contains("jaarrekening") || head.contains("jaarrekening") {
        "jaarrekening"
    } else if fn_lower.contains("offerte") || head.contains("aanbieding") {
        "offertes"
    } else if fn_lower.contains("review") || fn_lower.contains("google") {
        "google_reviews"
    } else if head.contains("coach") || head.contains("sessie") {
        "coaching_chat"
    } else {
        "generic"
    }
}

/// Default strategy for a hinted document type
pub fn strategy_for_document_type(doc_type: &str) -> &'static str {
    match doc_type {
        "annual_report_pdf" | "jaarrekening" => "page_plus_table_aware",
        "offer_doc" | "offertes" => "semantic_sections",
        "coaching_doc" | "coaching_chat" | "chatlog" => "conversation_turns",
        "review_doc" | "google_reviews" => "reviews",
        _ => "default",
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Split on blank-line paragraph boundaries, dropping empty paragraphs
pub(crate) fn split_paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split into sentences, keeping terminal punctuation attached.
/// A sentence boundary is one or more of `.!?` followed by whitespace.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            // Consume any further terminal punctuation
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            // Boundary only when whitespace (or end) follows
            if chars.peek().map_or(true, |c| c.is_whitespace()) {
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let sentence = current.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Paragraph accumulator shared by several strategies: append paragraphs while
/// the buffer stays within `max_chars`, flush on overflow, and carry the last
/// `overlap` characters into the next chunk.
pub(crate) fn accumulate_paragraphs(paras: &[&str], max_chars: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for para in paras {
        if buf.len() + para.len() + 2 <= max_chars {
            if buf.is_empty() {
                buf = para.to_string();
            } else {
                buf.push_str("\n\n");
                buf.push_str(para);
            }
        } else if buf.is_empty() {
            // First paragraph already oversize, keep it whole
            buf = para.to_string();
        } else {
            chunks.push(buf.clone());
            if overlap > 0 && buf.len() > overlap {
                let carry = tail_chars(&buf, overlap);
                buf = format!("{}\n\n{}", carry, para);
            } else {
                buf = para.to_string();
            }
        }
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}

/// Last `n` characters of a string, respecting char boundaries
pub(crate) fn tail_chars(text: &str, n: usize) -> &str {
    let char_count = text.chars().count();
    if char_count <= n {
        return text;
    }
    let skip = char_count - n;
    let (idx, _) = text.char_indices().nth(skip).unwrap_or((0, ' '));
    &text[idx..]
}

/// Split text into sentence-bounded chunks no longer than `max_chars` (soft)
pub(crate) fn chunk_by_sentences(text: &str, max_chars: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return vec![text.trim().to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        if !current.is_empty() && current.len() + sentence.len() + 1 > max_chars {
            chunks.push(current.trim().to_string());
            current = String::new();
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}
