//! Semantic section chunking strategy
//!
//! Splits on Markdown-style headers (`#`, `##`, `###`) and setext underlines
//! (`===` / `---`). Each section carries its header prefix; oversize sections
//! are re-chunked with the paragraph accumulator.

use super::{accumulate_paragraphs, split_paragraphs, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static ATX_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,3}\s+\S").unwrap());
static SETEXT_UNDERLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(={3,}|-{3,})\s*$").unwrap());

struct Section {
    header: Option<String>,
    body: Vec<String>,
}

pub struct SemanticSectionsStrategy;

impl SemanticSectionsStrategy {
    fn parse_sections(text: &str) -> Vec<Section> {
        let lines: Vec<&str> = text.lines().collect();
        let mut sections: Vec<Section> = Vec::new();
        let mut current = Section { header: None, body: Vec::new() };

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let is_atx = ATX_HEADER.is_match(line.trim_start());
            let is_setext = i + 1 < lines.len()
                && !line.trim().is_empty()
                && SETEXT_UNDERLINE.is_match(lines[i + 1].trim());

            if is_atx || is_setext {
                if current.header.is_some() || !current.body.iter().all(|l| l.trim().is_empty()) {
                    sections.push(current);
                }
                current = Section {
                    header: Some(line.trim().to_string()),
                    body: Vec::new(),
                };
                if is_setext {
                    i += 1; // skip the underline
                }
            } else {
                current.body.push(line.to_string());
            }
            i += 1;
        }
        if current.header.is_some() || !current.body.iter().all(|l| l.trim().is_empty()) {
            sections.push(current);
        }
        sections
    }
}

impl ChunkStrategy for SemanticSectionsStrategy {
    fn name(&self) -> &'static str {
        "semantic_sections"
    }

    fn description(&self) -> &'static str {
        "Splits on Markdown-style headers and setext underlines; each chunk keeps its section header"
    }

    fn default_config(&self) -> Value {
        json!({"max_chars": 1200, "overlap": 150, "split_on_headers": true})
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.2f32;

        let mut header_count = 0usize;
        let lines: Vec<&str> = sample.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if ATX_HEADER.is_match(line.trim_start()) {
                header_count += 1;
            } else if i + 1 < lines.len()
                && !line.trim().is_empty()
                && SETEXT_UNDERLINE.is_match(lines[i + 1].trim())
            {
                header_count += 1;
            }
        }

        if header_count >= 3 {
            score += 0.45;
        } else if header_count >= 1 {
            score += 0.25;
        }

        if let Some(meta) = metadata {
            let fname = meta.filename_lower();
            if fname.ends_with(".md") || fname.ends_with(".markdown") {
                score += 0.2;
            }
            if meta.doc_type.as_deref() == Some("offertes") || meta.doc_type.as_deref() == Some("offer_doc") {
                score += 0.15;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let sections = Self::parse_sections(text);
        if sections.len() <= 1 && sections.iter().all(|s| s.header.is_none()) {
            let paras = split_paragraphs(text);
            return accumulate_paragraphs(&paras, config.max_chars, config.overlap);
        }

        let mut chunks = Vec::new();
        for section in sections {
            let body = section.body.join("\n");
            let body = body.trim();
            let full = match &section.header {
                Some(header) if body.is_empty() => header.clone(),
                Some(header) => format!("{}\n\n{}", header, body),
                None => body.to_string(),
            };
            if full.trim().is_empty() {
                continue;
            }

            if full.len() > config.max_chars {
                let header_prefix = section
                    .header
                    .as_ref()
                    .map(|h| format!("{}\n\n", h))
                    .unwrap_or_default();
                let budget = config.max_chars.saturating_sub(header_prefix.len()).max(1);
                let paras = split_paragraphs(body);
                for sub in accumulate_paragraphs(&paras, budget, config.overlap) {
                    chunks.push(format!("{}{}", header_prefix, sub));
                }
            } else {
                chunks.push(full);
            }
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_atx_headers() {
        let text = "# Intro\nSome intro text.\n\n## Scope\nScope of the work.\n\n## Price\nThe price section.";
        let chunks = SemanticSectionsStrategy.chunk(text, &ChunkConfig::new(1200, 0));
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("# Intro"));
        assert!(chunks[1].starts_with("## Scope"));
        assert!(chunks[2].contains("price section"));
    }

    #[test]
    fn test_setext_headers() {
        let text = "Title\n=====\nBody under the title.\n\nSubtitle\n--------\nBody under subtitle.";
        let chunks = SemanticSectionsStrategy.chunk(text, &ChunkConfig::new(1200, 0));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("Title"));
        assert!(chunks[0].contains("Body under the title"));
        assert!(chunks[1].starts_with("Subtitle"));
    }

    #[test]
    fn test_oversize_section_keeps_header() {
        let body = (0..12)
            .map(|i| format!("Paragraph {} in a very long section of the document.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = format!("## Long Section\n{}", body);
        let chunks = SemanticSectionsStrategy.chunk(&text, &ChunkConfig::new(200, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("## Long Section"));
        }
    }

    #[test]
    fn test_no_headers_falls_back() {
        let text = "No headers here.\n\nJust two paragraphs.";
        let chunks = SemanticSectionsStrategy.chunk(text, &ChunkConfig::new(1200, 0));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_applicability() {
        let strategy = SemanticSectionsStrategy;
        let with_headers = "# A\ntext\n## B\ntext\n## C\ntext";
        let without = "plain text\n\nmore plain text";
        assert!(strategy.applicability(with_headers, None) > strategy.applicability(without, None));
    }
}
