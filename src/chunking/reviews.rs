//! Review chunking strategy
//!
//! One review = one chunk, never two reviews together. Reviews longer than
//! the token budget split on sentence boundaries with a `[PART: i/n]` marker.

use super::{split_sentences, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// Rough chars-per-token ratio for Dutch/English text
const CHARS_PER_TOKEN: usize = 4;

static RATING_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Rating:|Beoordeling:|\*+|★+)\s*[1-5](?:/5)?\s*\n").unwrap());

static AUTHOR_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Review by|Recensie van|Door)\s+[A-Z][a-z]+(?:\s+[A-Z]\.?)?\s*\n").unwrap());

static REVIEW_INDICATORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(rating|beoordeling|sterren|stars)\b",
        r"(?i)\b(review|recensie|ervaring)\b",
        r"(?i)\b(google|yelp|tripadvisor)\b",
        r"[★⭐]{1,5}",
        r"\b[1-5]/5\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const POSITIVE_WORDS: &[&str] = &["geweldig", "fantastisch", "uitstekend", "top", "prima", "goed", "fijn", "aanrader"];
const NEGATIVE_WORDS: &[&str] = &["slecht", "teleurstellend", "nooit meer", "niet aanraden", "verschrikkelijk", "onacceptabel"];

const FILENAME_HINTS: &[&str] = &["review", "recensie", "google", "yelp", "feedback"];

pub struct ReviewsStrategy;

impl ReviewsStrategy {
    /// Split multi-review input into individual review bodies
    fn extract_reviews(text: &str) -> Vec<String> {
        for separator in [&*RATING_SEPARATOR, &*AUTHOR_SEPARATOR] {
            if separator.find_iter(text).count() > 1 {
                return separator
                    .split(text)
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        vec![]
    }

    fn format_chunk(review: &str, part: Option<(usize, usize)>) -> String {
        let mut parts = vec!["[REVIEW]".to_string()];
        if let Some((i, n)) = part {
            parts.push(format!("[PART: {}/{}]", i, n));
        }
        parts.push(String::new());
        parts.push(format!("Reviewtekst:\n\"{}\"", review));
        parts.join("\n")
    }

    fn split_long_review(review: &str, max_tokens: usize) -> Vec<String> {
        let max_chars = max_tokens * CHARS_PER_TOKEN;
        let total_parts = review.len() / max_chars + 1;

        let sentences = split_sentences(review);
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        for sentence in sentences {
            if !current.is_empty() && current.len() + sentence.len() + 1 > max_chars {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
        }
        if !current.trim().is_empty() {
            parts.push(current.trim().to_string());
        }

        let n = total_parts.max(parts.len());
        parts
            .iter()
            .enumerate()
            .map(|(i, part)| Self::format_chunk(part, Some((i + 1, n))))
            .collect()
    }
}

impl ChunkStrategy for ReviewsStrategy {
    fn name(&self) -> &'static str {
        "reviews"
    }

    fn description(&self) -> &'static str {
        "Optimized for review data: Google Reviews, customer feedback (1 review = 1 chunk)"
    }

    fn default_config(&self) -> Value {
        json!({
            "max_chars": 2800,
            "overlap": 0,
            "max_tokens": 700,
            "split_long_reviews": true,
            "min_review_length": 10
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.3f32;

        let indicator_count: usize = REVIEW_INDICATORS
            .iter()
            .map(|p| p.find_iter(sample).count())
            .sum();
        if indicator_count >= 2 {
            score += 0.25;
        } else if indicator_count == 1 {
            score += 0.15;
        }

        let lower = sample.to_lowercase();
        let sentiment_count = POSITIVE_WORDS
            .iter()
            .chain(NEGATIVE_WORDS.iter())
            .filter(|w| lower.contains(*w))
            .count();
        if sentiment_count >= 3 {
            score += 0.2;
        } else if sentiment_count >= 1 {
            score += 0.1;
        }

        if let Some(meta) = metadata {
            if meta.doc_type.as_deref() == Some("review")
                || meta.doc_type.as_deref() == Some("google_reviews")
            {
                score += 0.3;
            }
            if matches!(meta.source.as_deref(), Some("google" | "yelp" | "tripadvisor" | "reviews")) {
                score += 0.25;
            }
            let fname = meta.filename_lower();
            if FILENAME_HINTS.iter().any(|h| fname.contains(h)) {
                score += 0.15;
            }
        }

        if sample.len() < 1000 {
            score += 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let max_tokens = config.usize_param("max_tokens", 700);
        let split_long = config.bool_param("split_long_reviews", true);
        let min_length = config.usize_param("min_review_length", 10);

        let mut reviews = Self::extract_reviews(text);
        if reviews.is_empty() {
            reviews = vec![text.trim().to_string()];
        }

        let mut chunks = Vec::new();
        for review in &reviews {
            if review.trim().len() < min_length {
                continue;
            }
            let estimated_tokens = review.len() / CHARS_PER_TOKEN;
            if estimated_tokens > max_tokens && split_long {
                chunks.extend(Self::split_long_review(review, max_tokens));
            } else {
                chunks.push(Self::format_chunk(review, None));
            }
        }

        if chunks.is_empty() && !text.trim().is_empty() {
            return vec![text.trim().to_string()];
        }
        chunks
    }
}
