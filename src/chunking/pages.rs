//! Page-aware chunking strategy
//!
//! Splits on explicit `[PAGE n]` markers (the contract with the upstream PDF
//! extractor). Oversize pages are re-chunked with the paragraph accumulator,
//! and every subchunk keeps its page header so hits stay attributable.

use super::{accumulate_paragraphs, split_paragraphs, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[PAGE \d+\]").unwrap());

pub struct PageTableAwareStrategy;

impl ChunkStrategy for PageTableAwareStrategy {
    fn name(&self) -> &'static str {
        "page_plus_table_aware"
    }

    fn description(&self) -> &'static str {
        "Respects page boundaries from [PAGE n] markers; oversize pages re-chunked with page headers retained"
    }

    fn default_config(&self) -> Value {
        json!({"max_chars": 1500, "overlap": 200, "respect_pages": true})
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.2f32;

        let marker_count = PAGE_MARKER.find_iter(sample).count();
        if marker_count >= 3 {
            score += 0.5;
        } else if marker_count >= 1 {
            score += 0.3;
        }

        if let Some(meta) = metadata {
            if meta.mime_type.as_deref() == Some("application/pdf")
                || meta.filename_lower().ends_with(".pdf")
            {
                score += 0.15;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let pages: Vec<&str> = PAGE_MARKER
            .split(text)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        if pages.is_empty() {
            let paras = split_paragraphs(text);
            return accumulate_paragraphs(&paras, config.max_chars, config.overlap);
        }

        let mut chunks = Vec::new();
        for (i, page) in pages.iter().enumerate() {
            let header = format!("[PAGE {}]\n", i + 1);

            if page.len() > config.max_chars {
                let budget = config.max_chars.saturating_sub(header.len()).max(1);
                let paras = split_paragraphs(page);
                for sub in accumulate_paragraphs(&paras, budget, config.overlap) {
                    chunks.push(format!("{}{}", header, sub));
                }
            } else {
                chunks.push(format!("{}{}", header, page));
            }
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_chunk_per_small_page() {
        let text = "[PAGE 1]\nFirst page content.\n\n[PAGE 2]\nSecond page content.";
        let chunks = PageTableAwareStrategy.chunk(text, &ChunkConfig::new(1500, 0));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("[PAGE 1]"));
        assert!(chunks[1].starts_with("[PAGE 2]"));
        assert!(chunks[1].contains("Second page content"));
    }

    #[test]
    fn test_oversize_page_keeps_header_on_every_subchunk() {
        let body = (0..10)
            .map(|i| format!("Paragraph number {} with a fair amount of text in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = format!("[PAGE 1]\n{}", body);
        let chunks = PageTableAwareStrategy.chunk(&text, &ChunkConfig::new(150, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("[PAGE 1]"), "subchunk lost page header: {:?}", chunk);
        }
    }

    #[test]
    fn test_no_markers_falls_back_to_paragraphs() {
        let text = "Just some text.\n\nWith two paragraphs.";
        let chunks = PageTableAwareStrategy.chunk(text, &ChunkConfig::new(1500, 0));
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].contains("[PAGE"));
    }

    #[test]
    fn test_applicability_scales_with_markers() {
        let strategy = PageTableAwareStrategy;
        let many = "[PAGE 1] a [PAGE 2] b [PAGE 3] c [PAGE 4] d";
        let none = "no page markers in sight";
        assert!(strategy.applicability(many, None) > strategy.applicability(none, None));
        assert!(strategy.applicability(many, None) >= 0.7);
    }
}
