//! Free text chunking strategy
//!
//! For narrative, unstructured prose: articles, reports, essays. Splits on
//! paragraphs, never mid-sentence; oversize paragraphs break at sentence
//! boundaries, overlap is taken as whole sentences, and undersized chunks
//! are merged with a neighbour.

use super::{split_paragraphs, split_sentences, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static STRUCTURE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?m)^\s*#{1,3}\s+").unwrap(),
        Regex::new(r"(?m)^\s*[*\-+]\s+").unwrap(),
        Regex::new(r"(?m)^\s*\d+[.)]\s+").unwrap(),
        Regex::new(r"\[PAGE\s+\d+\]").unwrap(),
        Regex::new(r"(?m)^[|+\-].*[|+\-]$").unwrap(),
    ]
});

const NARRATIVE_WORDS: &[&str] = &[
    "vertelde", "zei", "dacht", "vroeg", "antwoordde", "echter", "daarom", "bovendien",
    "namelijk", "vervolgens", "daarna", "toen", "plotseling", "however", "therefore",
    "moreover", "afterwards", "suddenly",
];

const FILENAME_HINTS: &[&str] = &["artikel", "verhaal", "essay", "blog", "rapport", "notitie", "article", "story", "report"];

pub struct FreeTextStrategy;

impl FreeTextStrategy {
    /// Whole sentences from the end of `text` totalling at most `overlap` chars
    fn overlap_sentences(text: &str, overlap: usize) -> String {
        if overlap == 0 {
            return String::new();
        }
        let sentences = split_sentences(text);
        let mut taken: Vec<&str> = Vec::new();
        let mut total = 0usize;
        for sentence in sentences.iter().rev() {
            if total + sentence.len() > overlap {
                break;
            }
            total += sentence.len() + 1;
            taken.push(sentence);
        }
        taken.reverse();
        taken.join(" ")
    }

    /// Merge chunks below `min_size` with the following chunk when the merged
    /// size stays within 3x the minimum
    fn merge_small_chunks(chunks: Vec<String>, min_size: usize) -> Vec<String> {
        if min_size == 0 || chunks.is_empty() {
            return chunks;
        }
        let mut merged: Vec<String> = Vec::with_capacity(chunks.len());
        let mut i = 0;
        while i < chunks.len() {
            let current = &chunks[i];
            if current.len() < min_size && i + 1 < chunks.len() {
                let combined = format!("{}\n\n{}", current, chunks[i + 1]);
                if combined.len() <= min_size * 3 {
                    merged.push(combined);
                    i += 2;
                    continue;
                }
            }
            merged.push(current.clone());
            i += 1;
        }
        merged
    }

    fn split_paragraph_by_sentences(para: &str, max_chars: usize) -> Vec<String> {
        let sentences = split_sentences(para);
        if sentences.is_empty() {
            return vec![para.to_string()];
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
}

impl ChunkStrategy for FreeTextStrategy {
    fn name(&self) -> &'static str {
        "free_text"
    }

    fn description(&self) -> &'static str {
        "Optimized for narrative, unstructured text (articles, stories, reports)"
    }

    fn default_config(&self) -> Value {
        json!({
            "max_chars": 1000,
            "overlap": 150,
            "min_chunk_chars": 200,
            "preserve_sentences": true
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.5f32;

        // Many complete, normally sized sentences
        let sentences = split_sentences(sample);
        let complete = sentences
            .iter()
            .filter(|s| s.len() > 20 && s.len() < 200)
            .count();
        if complete >= 5 {
            score += 0.2;
        }

        // Long paragraphs suggest running prose
        let paras = split_paragraphs(sample);
        if !paras.is_empty() {
            let avg = paras.iter().map(|p| p.len()).sum::<usize>() / paras.len();
            if avg > 200 {
                score += 0.15;
            }
        }

        // Penalize structural markers (headers, lists, tables, page breaks)
        for marker in STRUCTURE_MARKERS.iter() {
            if marker.find_iter(sample).count() > 3 {
                score -= 0.1;
            }
        }

        // Narrative vocabulary
        let lower = sample.to_lowercase();
        let narrative_hits: usize = NARRATIVE_WORDS.iter().map(|w| lower.matches(w).count()).sum();
        if narrative_hits > 2 {
            score += 0.1;
        }

        if let Some(meta) = metadata {
            let fname = meta.filename_lower();
            if FILENAME_HINTS.iter().any(|h| fname.contains(h)) {
                score += 0.1;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let min_chunk = config.usize_param("min_chunk_chars", 200);
        let preserve_sentences = config.bool_param("preserve_sentences", true);

        let paras = split_paragraphs(text);
        if paras.is_empty() {
            let trimmed = text.trim();
            return if trimmed.is_empty() { vec![] } else { vec![trimmed.to_string()] };
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();

        for para in paras {
            let needed = if current.is_empty() { para.len() } else { current.len() + para.len() + 2 };
            if needed <= config.max_chars {
                if current.is_empty() {
                    current = para.to_string();
                } else {
                    current.push_str("\n\n");
                    current.push_str(para);
                }
                continue;
            }

            if !current.is_empty() {
                chunks.push(current.clone());
                let carry = if preserve_sentences {
                    Self::overlap_sentences(&current, config.overlap)
                } else if config.overlap > 0 && current.len() > config.overlap {
                    super::tail_chars(&current, config.overlap).to_string()
                } else {
                    String::new()
                };
                current = if carry.is_empty() {
                    para.to_string()
                } else {
                    format!("{}\n\n{}", carry, para)
                };
            } else if preserve_sentences && para.len() > config.max_chars {
                // Oversize opening paragraph: split at sentence boundaries,
                // keep the last piece open for accumulation
                let mut subs = Self::split_paragraph_by_sentences(para, config.max_chars);
                current = subs.pop().unwrap_or_default();
                chunks.extend(subs);
            } else {
                current = para.to_string();
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        Self::merge_small_chunks(chunks, min_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_chars: usize, overlap: usize) -> ChunkConfig {
        let mut config = ChunkConfig::new(max_chars, overlap);
        config.extra.insert("min_chunk_chars".into(), serde_json::json!(0));
        config
    }

    #[test]
    fn test_never_splits_mid_sentence() {
        let para = "This is the first sentence of a longer paragraph. \
                    Here comes the second sentence with some more words. \
                    And a third sentence follows right after it. \
                    A fourth sentence closes the paragraph nicely.";
        let chunks = FreeTextStrategy.chunk(para, &cfg(120, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let trimmed = chunk.trim_end();
            assert!(
                trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?'),
                "chunk should end on a sentence boundary: {:?}",
                trimmed
            );
        }
    }

    #[test]
    fn test_overlap_is_whole_sentences() {
        let text = "Sentence alpha sits here quietly. Sentence beta follows along. \
                    Sentence gamma continues the flow.\n\n\
                    Sentence delta opens paragraph two. Sentence epsilon adds detail. \
                    Sentence zeta wraps everything up nicely.";
        let chunks = FreeTextStrategy.chunk(text, &cfg(110, 40));
        if chunks.len() > 1 {
            // The carried overlap must itself be complete sentences
            let second = &chunks[1];
            let first_period = second.find('.').unwrap_or(second.len() - 1);
            let lead = &second[..=first_period];
            assert!(
                lead.trim().split_whitespace().count() >= 2,
                "overlap lead should be a full sentence: {:?}",
                lead
            );
        }
    }

    #[test]
    fn test_merges_small_chunks() {
        let chunks = vec![
            "tiny".to_string(),
            "also a fairly small chunk here".to_string(),
            "a third completely separate chunk".to_string(),
        ];
        let merged = FreeTextStrategy::merge_small_chunks(chunks, 40);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].contains("tiny"));
        assert!(merged[0].contains("also a fairly small"));
    }

    #[test]
    fn test_merge_respects_max_size() {
        let chunks = vec!["tiny".to_string(), "y".repeat(200)];
        // merged would be > 3 * 50, so no merge
        let merged = FreeTextStrategy::merge_small_chunks(chunks.clone(), 50);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_applicability_favours_prose_over_tables() {
        let prose = "The committee met on Thursday afternoon to discuss the annual plans. \
                     Several members raised concerns about the project timeline. \
                     After a long debate they agreed to postpone the decision. \
                     The chairman thanked everyone for attending the session. \
                     Minutes will be distributed early next week to all participants.";
        let table = "| id | name | amount |\n|----|------|--------|\n| 1 | a | 10 |\n| 2 | b | 20 |\n| 3 | c | 30 |\n| 4 | d | 40 |";
        let strategy = FreeTextStrategy;
        assert!(strategy.applicability(prose, None) > strategy.applicability(table, None));
    }
}
