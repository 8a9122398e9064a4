//! Default chunking strategy
//!
//! Paragraph accumulator with optional character overlap. Works on any
//! document type and serves as the fallback when a specialist strategy fails.

use super::{accumulate_paragraphs, split_paragraphs, ChunkConfig, ChunkStrategy, StrategyMetadata};
use serde_json::{json, Value};

pub struct DefaultStrategy;

impl ChunkStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn description(&self) -> &'static str {
        "Standard paragraph-based chunking with optional overlap"
    }

    fn default_config(&self) -> Value {
        json!({"max_chars": 800, "overlap": 0})
    }

    /// Always usable, low priority: picked only when nothing specific fits
    fn applicability(&self, _sample: &str, _metadata: Option<&StrategyMetadata>) -> f32 {
        0.3
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let paras = split_paragraphs(text);
        if paras.is_empty() {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                vec![]
            } else {
                vec![trimmed.to_string()]
            };
        }

        let chunks = accumulate_paragraphs(&paras, config.max_chars, config.overlap);
        if chunks.is_empty() && !text.trim().is_empty() {
            return vec![text.trim().to_string()];
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
        DefaultStrategy.chunk(text, &ChunkConfig::new(max_chars, overlap))
    }

    #[test]
    fn test_empty_input() {
        assert!(chunk("", 800, 0).is_empty());
        assert!(chunk("  \n \n ", 800, 0).is_empty());
    }

    #[test]
    fn test_single_small_paragraph() {
        let chunks = chunk("Just one paragraph.", 800, 0);
        assert_eq!(chunks, vec!["Just one paragraph.".to_string()]);
    }

    #[test]
    fn test_accumulates_until_limit() {
        let text = "Para one is here.\n\nPara two is here.\n\nPara three is here.";
        let chunks = chunk(text, 45, 0);
        assert!(chunks.len() >= 2);
        // Every paragraph survives somewhere
        let joined = chunks.join("\n\n");
        assert!(joined.contains("Para one"));
        assert!(joined.contains("Para three"));
    }

    #[test]
    fn test_overlap_carries_tail() {
        let text = "First paragraph with some content here.\n\nSecond paragraph with more content.\n\nThird paragraph to overflow the buffer completely now.";
        let chunks = chunk(text, 60, 15);
        assert!(chunks.len() >= 2);
        for window in chunks.windows(2) {
            let tail: String = window[0]
                .chars()
                .rev()
                .take(15)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            assert!(window[1].starts_with(&tail), "next chunk should start with overlap tail");
        }
    }

    #[test]
    fn test_oversize_paragraph_kept_whole() {
        let big = "x".repeat(500);
        let chunks = chunk(&big, 100, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 500);
    }

    #[test]
    fn test_no_overlap_when_disabled() {
        let text = "Alpha paragraph content.\n\nBeta paragraph content.\n\nGamma paragraph content.";
        let chunks = chunk(text, 30, 0);
        for window in chunks.windows(2) {
            assert!(!window[1].starts_with(window[0].split_whitespace().last().unwrap_or("")));
        }
    }
}
