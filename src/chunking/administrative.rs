//! Administrative document chunking strategy
//!
//! For policy notes, council decisions, grants and permits. Special sections
//! (Besluit, Motivering, Voorwaarden, Uitsluitingen, Procedure, Termijnen)
//! are always emitted as their own chunk, even when short, so eligibility
//! questions can be answered from a single chunk. Regular sections are
//! re-chunked on paragraph boundaries with overlap.

use super::{split_paragraphs, tail_chars, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static SPECIAL_SECTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)^\s*(BESLUIT|BESLISSING|BESCHIKKING)\b",
        r"(?im)^\s*(MOTIVERING|OVERWEGINGEN?|TOELICHTING)\b",
        r"(?im)^\s*(RANDVOORWAARDEN?|VOORWAARDEN?|BEPALINGEN)\b",
        r"(?im)^\s*(UITSLUITINGEN?|NIET IN AANMERKING)\b",
        r"(?im)^\s*(PROCEDURE|AANVRAAGPROCEDURE|STAPPEN)\b",
        r"(?im)^\s*(TERMIJNEN?|DEADLINES?)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static GENERAL_HEADERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?m)^(\d+\.?\s+[A-Z][^\n]{5,60})$").unwrap(),
        Regex::new(r"(?m)^([A-Z][A-Z\s]{10,50})$").unwrap(),
    ]
});

static ADMINISTRATIVE_TERMS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(college van b\s*&\s*w|burgemeester|wethouder)\b",
        r"(?i)\b(gemeenteraad|raadsbesluit|raadsvergadering)\b",
        r"(?i)\b(besluit|besluiten|beslissing|beschikking)\b",
        r"(?i)\b(subsidie|subsidieverlening)\b",
        r"(?i)\b(vergunning|ontheffing|toestemming)\b",
        r"(?i)\b(beleid|beleidsplan|beleidsnota)\b",
        r"(?i)\b(advies|adviseert|geadviseerd)\b",
        r"(?i)\b(overwegende dat|gelet op|gezien)\b",
        r"(?i)\b(krachtens|ingevolge|op grond van)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SUBSIDY_TERMS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(in aanmerking|aanspraak|komen voor)\b",
        r"(?i)\b(voorwaarde|voldoen aan|vereist)\b",
        r"(?i)\b(uitgesloten|niet in aanmerking|afgewezen)\b",
        r"(?i)\b(aanvraag|indienen|aanvrager)\b",
        r"(?i)\b(termijn|uiterlijk)\b",
        r"(?i)\b(budget|beschikbaar|maximaal bedrag)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const FILENAME_HINTS: &[&str] = &[
    "besluit", "beleid", "subsidie", "vergunning", "nota", "advies", "raads", "college",
];

#[derive(Debug, PartialEq, Clone, Copy)]
enum SectionKind {
    Special,
    Important,
    Regular,
}

struct Section {
    kind: SectionKind,
    header: String,
    content: String,
}

pub struct AdministrativeStrategy;

impl AdministrativeStrategy {
    fn split_sections(text: &str) -> Vec<Section> {
        // (match start, header end, header text, kind)
        let mut matches: Vec<(usize, usize, String, SectionKind)> = Vec::new();

        for pattern in SPECIAL_SECTIONS.iter() {
            for caps in pattern.captures_iter(text) {
                let m = caps.get(1).unwrap();
                matches.push((m.start(), m.end(), m.as_str().trim().to_string(), SectionKind::Special));
            }
        }
        for pattern in GENERAL_HEADERS.iter() {
            for caps in pattern.captures_iter(text) {
                let m = caps.get(1).unwrap();
                // Skip headers overlapping an already detected special section
                if !matches.iter().any(|(pos, _, _, _)| m.start().abs_diff(*pos) < 10) {
                    matches.push((m.start(), m.end(), m.as_str().trim().to_string(), SectionKind::Regular));
                }
            }
        }
        matches.sort_by_key(|(pos, _, _, _)| *pos);

        if matches.is_empty() {
            return vec![];
        }

        let mut sections = Vec::new();
        if matches[0].0 > 50 {
            let preamble = text[..matches[0].0].trim();
            if !preamble.is_empty() {
                sections.push(Section {
                    kind: SectionKind::Important,
                    header: "Inleiding".to_string(),
                    content: preamble.to_string(),
                });
            }
        }

        for (i, (_, header_end, header, kind)) in matches.iter().enumerate() {
            let next = matches.get(i + 1).map(|(p, _, _, _)| *p).unwrap_or(text.len());
            let content = if *header_end < next {
                text[*header_end..next].trim().to_string()
            } else {
                String::new()
            };
            sections.push(Section {
                kind: *kind,
                header: header.clone(),
                content,
            });
        }
        sections
    }

    fn format_section(kind: SectionKind, header: &str, content: &str) -> String {
        let mut parts = Vec::new();
        match kind {
            SectionKind::Special => {
                parts.push(format!("[SECTIE: {}]", header));
                parts.push("[TYPE: BELANGRIJK]".to_string());
            }
            SectionKind::Important => {
                parts.push(format!("[SECTIE: {}]", header));
            }
            SectionKind::Regular => {
                if !header.is_empty() {
                    parts.push(format!("[{}]", header));
                }
            }
        }
        parts.push(String::new());
        parts.push(content.to_string());
        parts.join("\n")
    }

    fn split_regular_section(header: &str, content: &str, config: &ChunkConfig) -> Vec<String> {
        let paras = split_paragraphs(content);
        let mut chunks = Vec::new();
        let mut current = String::new();

        for para in paras {
            let candidate_len = if current.is_empty() {
                para.len()
            } else {
                current.len() + para.len() + 2
            };
            if candidate_len <= config.max_chars {
                if current.is_empty() {
                    current = para.to_string();
                } else {
                    current.push_str("\n\n");
                    current.push_str(para);
                }
            } else {
                if !current.is_empty() {
                    chunks.push(Self::format_section(SectionKind::Regular, header, &current));
                }
                if config.overlap > 0 && current.len() > config.overlap {
                    current = format!("{}\n\n{}", tail_chars(&current, config.overlap), para);
                } else {
                    current = para.to_string();
                }
            }
        }
        if !current.is_empty() {
            chunks.push(Self::format_section(SectionKind::Regular, header, &current));
        }
        chunks
    }

    fn fallback_chunking(text: &str, config: &ChunkConfig) -> Vec<String> {
        let paras = split_paragraphs(text);
        super::accumulate_paragraphs(&paras, config.max_chars, config.overlap)
    }
}

impl ChunkStrategy for AdministrativeStrategy {
    fn name(&self) -> &'static str {
        "administrative"
    }

    fn description(&self) -> &'static str {
        "Optimized for government documents: policy notes, decisions, grants, permits"
    }

    fn default_config(&self) -> Value {
        json!({
            "max_chars": 1200,
            "overlap": 100,
            "split_special_sections": true,
            "preserve_structure": true
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.3f32;

        let special_hits = SPECIAL_SECTIONS.iter().filter(|p| p.is_match(sample)).count();
        if special_hits >= 2 {
            score += 0.3;
        } else if special_hits == 1 {
            score += 0.15;
        }

        let admin_terms: usize = ADMINISTRATIVE_TERMS
            .iter()
            .map(|p| p.find_iter(sample).count())
            .sum();
        if admin_terms >= 5 {
            score += 0.2;
        } else if admin_terms >= 3 {
            score += 0.1;
        }

        let subsidy_terms: usize = SUBSIDY_TERMS.iter().map(|p| p.find_iter(sample).count()).sum();
        if subsidy_terms >= 3 {
            score += 0.15;
        }

        if let Some(meta) = metadata {
            let fname = meta.filename_lower();
            if FILENAME_HINTS.iter().any(|h| fname.contains(h)) {
                score += 0.15;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let split_special = config.bool_param("split_special_sections", true);

        let sections = Self::split_sections(text);
        if sections.is_empty() {
            return Self::fallback_chunking(text, config);
        }

        let mut chunks = Vec::new();
        for section in &sections {
            let special = matches!(section.kind, SectionKind::Special | SectionKind::Important);
            if split_special && special {
                // Special sections are their own chunk even when short
                chunks.push(Self::format_section(section.kind, &section.header, &section.content));
            } else if section.content.len() > config.max_chars {
                chunks.extend(Self::split_regular_section(&section.header, &section.content, config));
            } else {
                chunks.push(Self::format_section(section.kind, &section.header, &section.content));
            }
        }
        chunks
    }
}
