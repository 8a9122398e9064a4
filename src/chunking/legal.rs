//! Legal document chunking strategy
//!
//! Article-based chunking for contracts, terms and regulations. One chunk per
//! article or sub-clause, marked with `[ARTIKEL n]` / `[ARTIKEL n.m]`.
//! Oversize articles split on sentence boundaries only. Overlap is forced to
//! zero: a clause must never leak into the chunk of its neighbour.

use super::{accumulate_paragraphs, chunk_by_sentences, split_paragraphs, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static ARTICLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?im)^\s*(?:Artikel|Art\.|Article|ARTIKEL)\s+(\d+(?:\.\d+)*)").unwrap(),
        Regex::new(r"(?m)^\s*§\s*(\d+(?:\.\d+)*)").unwrap(),
        Regex::new(r"(?m)^\s*(\d+)\.\s+[A-Z]").unwrap(),
    ]
});

static SUBCLAUSE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?m)^\s*(\d+)\.\s").unwrap(),
        Regex::new(r"(?m)^\s*([a-z])\)\s").unwrap(),
        Regex::new(r"(?m)^\s*([a-z])\.\s").unwrap(),
        Regex::new(r"(?m)^\s*\(([a-z0-9]+)\)\s").unwrap(),
    ]
});

static LEGAL_TERMS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(artikel|art\.|paragraaf|lid)\b",
        r"(?i)\b(bepaling|voorwaarde|verplichting)\b",
        r"(?i)\b(partij(?:en)?|contractant|schuldeiser)\b",
        r"(?i)\b(overeenkomst|contract|verbintenis)\b",
        r"(?i)\b(aansprakelijk(?:heid)?|schade|vordering)\b",
        r"(?i)\b(opzeggen|ontbinden|beëindigen)\b",
        r"(?i)\b(wet|wetgeving|regelgeving|richtlijn)\b",
        r"(?i)\b(rechtbank|rechter|arbitrage)\b",
        r"(?i)\b(dwingend|aanvullend|vernietigbaar)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static NUMBERED_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\d+\.").unwrap());

const FILENAME_HINTS: &[&str] = &[
    "contract", "overeenkomst", "voorwaarden", "algemene", "wet", "regeling",
    "apv", "verordening", "richtlijn", "subsidie", "beleid", "juridisch", "legal",
];

struct Article {
    number: String,
    title: String,
    content: String,
}

pub struct LegalStrategy;

impl LegalStrategy {
    fn split_articles(text: &str) -> Vec<Article> {
        for pattern in ARTICLE_PATTERNS.iter() {
            let matches: Vec<regex::Captures> = pattern.captures_iter(text).collect();
            if matches.len() < 2 {
                continue;
            }

            let mut articles = Vec::new();
            for (i, caps) in matches.iter().enumerate() {
                let whole = caps.get(0).unwrap();
                let start = whole.start();
                let end = matches
                    .get(i + 1)
                    .map(|c| c.get(0).unwrap().start())
                    .unwrap_or(text.len());

                let number = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();

                // Header line: from the match to the end of its line
                let header_end = text[start..end]
                    .find('\n')
                    .map(|i| start + i)
                    .unwrap_or(end);
                let header_line = text[start..header_end].trim();

                // Title: whatever follows the number on the header line
                let title = header_line
                    .split_once(number.as_str())
                    .map(|(_, rest)| rest.trim_matches(|c: char| c.is_whitespace() || ":.-".contains(c)))
                    .unwrap_or("")
                    .to_string();

                let content = text[header_end..end].trim().to_string();
                articles.push(Article { number, title, content });
            }
            if !articles.is_empty() {
                return articles;
            }
        }
        vec![]
    }

    fn split_subclauses(content: &str) -> Vec<(String, String)> {
        for pattern in SUBCLAUSE_PATTERNS.iter() {
            let matches: Vec<regex::Captures> = pattern.captures_iter(content).collect();
            if matches.len() < 2 {
                continue;
            }
            let mut clauses = Vec::new();
            for (i, caps) in matches.iter().enumerate() {
                let start = caps.get(0).unwrap().start();
                let end = matches
                    .get(i + 1)
                    .map(|c| c.get(0).unwrap().start())
                    .unwrap_or(content.len());
                let sub_number = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
                clauses.push((sub_number, content[start..end].trim().to_string()));
            }
            return clauses;
        }
        vec![]
    }

    fn format_chunk(number: &str, title: &str, content: &str) -> String {
        let mut parts = vec![format!("[ARTIKEL {}]", number)];
        if !title.is_empty() {
            parts.push(format!("[TITEL: {}]", title));
        }
        parts.push(String::new());
        parts.push(content.to_string());
        parts.join("\n")
    }

    fn chunk_article(article: &Article, config: &ChunkConfig) -> Vec<String> {
        let split_subclauses = config.bool_param("split_subarticles", true);

        if split_subclauses && article.content.len() > config.max_chars {
            let clauses = Self::split_subclauses(&article.content);
            if !clauses.is_empty() {
                return clauses
                    .iter()
                    .map(|(sub, content)| {
                        Self::format_chunk(
                            &format!("{}.{}", article.number, sub),
                            &article.title,
                            content,
                        )
                    })
                    .collect();
            }
            // No sub-clause structure: split on sentences, never mid-sentence
            return chunk_by_sentences(&article.content, config.max_chars)
                .iter()
                .map(|part| Self::format_chunk(&article.number, &article.title, part))
                .collect();
        }

        vec![Self::format_chunk(&article.number, &article.title, &article.content)]
    }

    fn fallback_chunking(text: &str, config: &ChunkConfig) -> Vec<String> {
        let paras = split_paragraphs(text);
        let mut chunks = Vec::new();
        for para in paras {
            if para.len() > config.max_chars {
                chunks.extend(chunk_by_sentences(para, config.max_chars));
            } else {
                chunks.push(para.to_string());
            }
        }
        // Re-accumulate small paragraphs, still without overlap
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        accumulate_paragraphs(&refs, config.max_chars, 0)
    }
}

impl ChunkStrategy for LegalStrategy {
    fn name(&self) -> &'static str {
        "legal"
    }

    fn description(&self) -> &'static str {
        "Optimized for legal documents: contracts, terms, laws, regulations (article-based)"
    }

    fn default_config(&self) -> Value {
        // Overlap stays zero: legal retrieval is reference-driven
        json!({
            "max_chars": 2000,
            "overlap": 0,
            "preserve_structure": true,
            "keep_full_sentences": true,
            "split_subarticles": true
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.3f32;

        let article_count: usize = ARTICLE_PATTERNS
            .iter()
            .map(|p| p.find_iter(sample).count())
            .sum();
        if article_count >= 3 {
            score += 0.35;
        } else if article_count >= 1 {
            score += 0.2;
        }

        let subclause_count: usize = SUBCLAUSE_PATTERNS
            .iter()
            .map(|p| p.find_iter(sample).count())
            .sum();
        if subclause_count >= 5 {
            score += 0.15;
        }

        let term_count: usize = LEGAL_TERMS.iter().map(|p| p.find_iter(sample).count()).sum();
        if term_count >= 5 {
            score += 0.2;
        } else if term_count >= 3 {
            score += 0.1;
        }

        if let Some(meta) = metadata {
            let fname = meta.filename_lower();
            if FILENAME_HINTS.iter().any(|h| fname.contains(h)) {
                score += 0.15;
            }
        }

        if NUMBERED_LINE.find_iter(sample).count() > 10 {
            score += 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        // Force zero overlap regardless of caller config
        let mut config = config.clone();
        config.overlap = 0;

        let articles = Self::split_articles(text);
        if articles.is_empty() {
            return Self::fallback_chunking(text, &config);
        }

        let mut chunks = Vec::new();
        for article in &articles {
            chunks.extend(Self::chunk_article(article, &config));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "Artikel 1 - Definities\n\
        In deze overeenkomst wordt verstaan onder opdrachtgever de partij die de opdracht verstrekt.\n\
        \n\
        Artikel 2 - Toepasselijkheid\n\
        Deze voorwaarden zijn van toepassing op alle aanbiedingen en overeenkomsten.\n\
        \n\
        Artikel 3 - Aansprakelijkheid\n\
        De aansprakelijkheid van de contractant is beperkt tot het factuurbedrag.";

    #[test]
    fn test_one_chunk_per_article() {
        let chunks = LegalStrategy.chunk(CONTRACT, &ChunkConfig::new(2000, 0));
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("[ARTIKEL 1]"));
        assert!(chunks[1].starts_with("[ARTIKEL 2]"));
        assert!(chunks[2].starts_with("[ARTIKEL 3]"));
    }

    #[test]
    fn test_titles_extracted() {
        let chunks = LegalStrategy.chunk(CONTRACT, &ChunkConfig::new(2000, 0));
        assert!(chunks[0].contains("[TITEL: Definities]"));
        assert!(chunks[2].contains("[TITEL: Aansprakelijkheid]"));
    }

    #[test]
    fn test_no_overlap_even_when_requested() {
        let chunks = LegalStrategy.chunk(CONTRACT, &ChunkConfig::new(2000, 300));
        // No trailing sentence of chunk i reappears at the start of chunk i+1
        for window in chunks.windows(2) {
            let last_sentence = window[0]
                .lines()
                .last()
                .unwrap_or("")
                .trim();
            if !last_sentence.is_empty() {
                assert!(
                    !window[1].contains(last_sentence),
                    "overlap leaked between legal chunks"
                );
            }
        }
    }

    #[test]
    fn test_subclauses_split() {
        let long_tail = "Verdere bepalingen over de verwerking volgen hier. ".repeat(10);
        let text = format!(
            "Artikel 1 - Verplichtingen\n\
             1. De eerste verplichting geldt voor beide partijen. {}\n\
             2. De tweede verplichting geldt alleen voor de opdrachtnemer. {}\n\
             \n\
             Artikel 2 - Slot\nKorte slotbepaling.",
            long_tail, long_tail
        );
        let chunks = LegalStrategy.chunk(&text, &ChunkConfig::new(300, 0));
        assert!(chunks.iter().any(|c| c.starts_with("[ARTIKEL 1.1]")));
        assert!(chunks.iter().any(|c| c.starts_with("[ARTIKEL 1.2]")));
        assert!(chunks.iter().any(|c| c.starts_with("[ARTIKEL 2]")));
    }

    #[test]
    fn test_oversize_article_splits_on_sentences() {
        let body = "Dit is een volledige juridische zin over het onderwerp. ".repeat(20);
        let text = format!("§ 1\n{}\n\n§ 2\nKorte paragraaf.", body);
        let chunks = LegalStrategy.chunk(&text, &ChunkConfig::new(400, 0));
        assert!(chunks.len() > 2);
        for chunk in &chunks {
            let trimmed = chunk.trim_end();
            assert!(trimmed.ends_with('.'), "chunk must end on a sentence boundary");
        }
    }

    #[test]
    fn test_fallback_without_articles() {
        let text = "Gewone tekst zonder artikelstructuur.\n\nTweede alinea volgt hier.";
        let chunks = LegalStrategy.chunk(text, &ChunkConfig::new(2000, 0));
        assert!(!chunks.is_empty());
        assert!(!chunks[0].contains("[ARTIKEL"));
    }

    #[test]
    fn test_applicability_high_for_contract() {
        let strategy = LegalStrategy;
        let score = strategy.applicability(CONTRACT, None);
        assert!(score >= 0.7, "contract should score high, got {}", score);
    }
}
