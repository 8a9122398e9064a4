//! Table-aware chunking strategy
//!
//! Line-based: contiguous table lines (pipe/plus/minus borders, or lines with
//! two or more tab separators) become a single `[TABLE]` chunk; surrounding
//! prose accumulates up to `max_chars`.

use super::{ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static PIPE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[|+\-].*[|+\-]$").unwrap());

/// Table line heuristic shared with the financial strategy
pub(crate) fn is_table_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if PIPE_ROW.is_match(trimmed) {
        return true;
    }
    line.matches('\t').count() >= 2
}

pub struct TableAwareStrategy;

impl ChunkStrategy for TableAwareStrategy {
    fn name(&self) -> &'static str {
        "table_aware"
    }

    fn description(&self) -> &'static str {
        "Keeps tables intact as single [TABLE] chunks; prose accumulates around them"
    }

    fn default_config(&self) -> Value {
        json!({"max_chars": 1000, "overlap": 100, "preserve_tables": true})
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.2f32;

        let table_lines = sample.lines().filter(|l| is_table_line(l)).count();
        if table_lines >= 6 {
            score += 0.4;
        } else if table_lines >= 3 {
            score += 0.25;
        }

        if let Some(meta) = metadata {
            let fname = meta.filename_lower();
            if fname.ends_with(".csv") || fname.ends_with(".tsv") || fname.ends_with(".xlsx") {
                score += 0.2;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut prose: Vec<&str> = Vec::new();
        let mut table: Vec<&str> = Vec::new();

        let flush_prose = |prose: &mut Vec<&str>, chunks: &mut Vec<String>| {
            let content = prose.join("\n");
            if !content.trim().is_empty() {
                chunks.push(content.trim().to_string());
            }
            prose.clear();
        };
        let flush_table = |table: &mut Vec<&str>, chunks: &mut Vec<String>| {
            if !table.is_empty() {
                chunks.push(format!("[TABLE]\n{}", table.join("\n")));
                table.clear();
            }
        };

        for line in text.lines() {
            if is_table_line(line) {
                if table.is_empty() {
                    flush_prose(&mut prose, &mut chunks);
                }
                table.push(line);
            } else {
                flush_table(&mut table, &mut chunks);
                prose.push(line);
                if prose.join("\n").len() > config.max_chars {
                    // Flush everything but the current line, which may start
                    // the next chunk (acts as a one-line overlap)
                    let keep = if config.overlap > 0 { prose.pop() } else { None };
                    flush_prose(&mut prose, &mut chunks);
                    if let Some(kept) = keep {
                        prose.push(kept);
                    }
                }
            }
        }
        flush_table(&mut table, &mut chunks);
        flush_prose(&mut prose, &mut chunks);

        if chunks.is_empty() && !text.trim().is_empty() {
            return vec![text.trim().to_string()];
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_detection() {
        assert!(is_table_line("| a | b | c |"));
        assert!(is_table_line("+----+----+"));
        assert!(is_table_line("x\ty\tz"));
        assert!(!is_table_line("regular prose line"));
        assert!(!is_table_line(""));
    }

    #[test]
    fn test_table_becomes_single_chunk() {
        let text = "Intro line about the data.\n\
                    | year | revenue |\n\
                    |------|---------|\n\
                    | 2023 | 100 |\n\
                    | 2024 | 120 |\n\
                    Closing remark.";
        let chunks = TableAwareStrategy.chunk(text, &ChunkConfig::new(1000, 0));
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].contains("Intro line"));
        assert!(chunks[1].starts_with("[TABLE]"));
        assert!(chunks[1].contains("| 2024 | 120 |"));
        assert!(chunks[2].contains("Closing remark"));
    }

    #[test]
    fn test_tab_separated_table() {
        let text = "header\ta\tb\nrow1\t1\t2\nrow2\t3\t4";
        let chunks = TableAwareStrategy.chunk(text, &ChunkConfig::new(1000, 0));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with("[TABLE]"));
    }

    #[test]
    fn test_long_prose_is_split() {
        let lines: Vec<String> = (0..30)
            .map(|i| format!("Prose line number {} with some filler words.", i))
            .collect();
        let text = lines.join("\n");
        let chunks = TableAwareStrategy.chunk(&text, &ChunkConfig::new(200, 100));
        assert!(chunks.len() > 1);
    }

    #[test]
    fn test_trailing_table_flushed() {
        let text = "Some prose.\n| a | b |\n| 1 | 2 |";
        let chunks = TableAwareStrategy.chunk(text, &ChunkConfig::new(1000, 0));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("[TABLE]"));
    }
}
