//! Financial table chunking strategy
//!
//! For annual reports, quotes and contracts. Detects financial and contract
//! sections, pulls tables out of each section, and chunks tables either
//! row-per-chunk (small tables) or KPI-per-chunk over a year range (large
//! time-series tables). Every chunk is prefixed with its section header.

use super::tables::is_table_line as is_plain_table_line;
use super::{ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// Row count above which a table is chunked per KPI instead of per row
const ROW_MODE_LIMIT: usize = 20;

static FINANCIAL_SECTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(balans|balance\s+sheet)",
        r"(?i)(resultatenrekening|winst[- ]en[- ]verlies|profit\s+and\s+loss|p&l|v&w)",
        r"(?i)(kasstroom|cashflow|cash\s+flow)",
        r"(?i)(toelichting|notes?|verklarende)",
        r"(?i)(waardering|valuation)",
        r"(?i)(eigen\s+vermogen|equity)",
        r"(?i)(bezittingen|assets|activa)",
        r"(?i)(schulden|liabilities|passiva)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static CONTRACT_SECTIONS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(scope|omvang|werkzaamheden)",
        r"(?i)(prijs|price|bedrag|tarief|kosten)",
        r"(?i)(looptijd|duration|termijn)",
        r"(?i)(levering|delivery|voorwaarden)",
        r"(?i)(betalings?voorwaarden|payment\s+terms)",
        r"(?i)(garantie|warranty)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static KPI_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(omzet|revenue|turnover)",
        r"(?i)(ebitda|ebit)",
        r"(?i)(winst|profit|resultaat)",
        r"(?i)(marge|margin)",
        r"(?i)(kosten|costs|expenses)",
        r"(?i)(activa|assets|bezittingen)",
        r"(?i)(passiva|liabilities|schulden)",
        r"(?i)(eigen\s+vermogen|equity)",
        r"(?i)(liquiditeit|liquidity|solvabiliteit)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static DECIMAL_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+[.,]\d{2,}").unwrap());
static CURRENCY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[€$£]\s*\d+|EUR|USD").unwrap());
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());
static TABLE_BORDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-+=|]+\s*$").unwrap());
static NUMBER_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+[.,]?\d*\b").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

const FILENAME_HINTS: &[&str] = &[
    "jaarrekening", "annual", "financial", "financieel", "balans", "resultaat",
    "offerte", "quote", "contract", "prijslijst", "tarief", "kosten", "taxatie",
];

/// Financial table line heuristic: the plain table detection plus
/// "several numbers in a short line" column layouts
fn is_table_line(line: &str) -> bool {
    if is_plain_table_line(line) || TABLE_BORDER.is_match(line) {
        return true;
    }
    let numbers = NUMBER_TOKEN.find_iter(line).count();
    numbers >= 3 && line.trim().len() < 200
}

fn split_cells(line: &str) -> Vec<String> {
    let cells: Vec<String> = if line.contains('|') {
        line.split('|').map(|c| c.trim().to_string()).collect()
    } else if line.contains('\t') {
        line.split('\t').map(|c| c.trim().to_string()).collect()
    } else {
        MULTI_SPACE.split(line).map(|c| c.trim().to_string()).collect()
    };
    cells.into_iter().filter(|c| !c.is_empty()).collect()
}

pub struct FinancialTablesStrategy;

impl FinancialTablesStrategy {
    /// Split the document at recognised section headers. A header candidate
    /// must sit at the start of a short non-table line, so a term like
    /// "activa" inside a table row does not open a new section. Text before
    /// the first header becomes an "Inleiding" section.
    fn split_sections(text: &str) -> Vec<(String, String)> {
        let mut matches: Vec<(usize, String)> = Vec::new();
        for pattern in FINANCIAL_SECTIONS.iter().chain(CONTRACT_SECTIONS.iter()) {
            for m in pattern.find_iter(text) {
                let line_start = text[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
                let line_end = text[m.start()..]
                    .find('\n')
                    .map(|i| m.start() + i)
                    .unwrap_or(text.len());
                let line = &text[line_start..line_end];
                if m.start() - line_start >= 3 || line.len() >= 80 || is_table_line(line) {
                    continue;
                }
                let header = line.trim().to_string();
                if !header.is_empty() {
                    matches.push((line_start, header));
                }
            }
        }
        matches.sort_by_key(|(pos, _)| *pos);
        matches.dedup_by_key(|(pos, _)| *pos);

        if matches.is_empty() {
            return vec![(String::new(), text.to_string())];
        }

        let mut sections = Vec::new();
        if matches[0].0 > 0 {
            let preamble = text[..matches[0].0].trim();
            if !preamble.is_empty() {
                sections.push(("Inleiding".to_string(), preamble.to_string()));
            }
        }
        for (i, (pos, header)) in matches.iter().enumerate() {
            let next = matches.get(i + 1).map(|(p, _)| *p).unwrap_or(text.len());
            let content = text[*pos..next]
                .trim_start_matches(header.as_str())
                .trim()
                .to_string();
            sections.push((header.clone(), content));
        }
        sections
    }

    /// Separate table runs from prose within one section
    fn extract_parts(content: &str) -> Vec<(bool, String)> {
        let mut parts: Vec<(bool, String)> = Vec::new();
        let mut buffer: Vec<&str> = Vec::new();
        let mut in_table = false;

        for line in content.lines() {
            let table_line = is_table_line(line);
            if table_line != in_table && !buffer.is_empty() {
                parts.push((in_table, buffer.join("\n")));
                buffer.clear();
            }
            in_table = table_line;
            buffer.push(line);
        }
        if !buffer.is_empty() {
            parts.push((in_table, buffer.join("\n")));
        }
        parts
            .into_iter()
            .filter(|(_, content)| !content.trim().is_empty())
            .collect()
    }

    fn chunk_table(table_text: &str, section_header: &str, config: &ChunkConfig) -> Vec<String> {
        let lines: Vec<&str> = table_text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return vec![];
        }

        // First non-border line is the header row
        let header_idx = lines
            .iter()
            .position(|l| !TABLE_BORDER.is_match(l))
            .unwrap_or(0);
        let header = lines[header_idx];
        let data_rows: Vec<&str> = lines[header_idx + 1..]
            .iter()
            .filter(|l| !TABLE_BORDER.is_match(l))
            .copied()
            .collect();

        let mut context = String::new();
        if !section_header.is_empty() {
            context.push_str(&format!("[{}]\n", section_header));
        }
        context.push_str("[TABEL]\n");

        let mode = config.str_param("table_mode", "hybrid");
        let row_mode = mode == "row" || (mode == "hybrid" && data_rows.len() <= ROW_MODE_LIMIT);

        let mut chunks = Vec::new();
        if row_mode {
            for row in &data_rows {
                chunks.push(format!("{}{}\n{}", context, header, row));
            }
        } else {
            // KPI-per-chunk over the year columns
            if let Some(parsed) = Self::parse_time_series(header, &data_rows) {
                for (kpi, values) in parsed {
                    let mut chunk = format!("{}KPI: {}\n", context, kpi);
                    for (year, value) in values {
                        chunk.push_str(&format!("{}: {}\n", year, value));
                    }
                    chunks.push(chunk.trim_end().to_string());
                }
            } else {
                for row in data_rows.iter().take(10) {
                    chunks.push(format!("{}{}\n{}", context, header, row));
                }
            }
        }

        if chunks.is_empty() {
            chunks.push(format!("{}{}", context, table_text));
        }
        chunks
    }

    /// Parse a table whose columns are years into KPI -> [(year, value)] rows
    fn parse_time_series(header: &str, rows: &[&str]) -> Option<Vec<(String, Vec<(String, String)>)>> {
        let cols = split_cells(header);
        if cols.len() < 2 {
            return None;
        }
        let year_cols: Vec<String> = cols[1..]
            .iter()
            .filter_map(|c| YEAR.find(c).map(|m| m.as_str().to_string()))
            .collect();
        if year_cols.is_empty() {
            return None;
        }

        let mut result = Vec::new();
        for row in rows.iter().take(50) {
            let cells = split_cells(row);
            if cells.len() < 2 {
                continue;
            }
            let kpi = cells[0].clone();
            let values: Vec<(String, String)> = year_cols
                .iter()
                .zip(cells[1..].iter())
                .filter(|(_, v)| !v.is_empty())
                .map(|(y, v)| (y.clone(), v.clone()))
                .collect();
            if !kpi.is_empty() && !values.is_empty() {
                result.push((kpi, values));
            }
        }
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }

    fn chunk_prose(text: &str, config: &ChunkConfig) -> Vec<String> {
        let paras = super::split_paragraphs(text);
        if paras.is_empty() {
            let trimmed = text.trim();
            return if trimmed.is_empty() { vec![] } else { vec![trimmed.to_string()] };
        }
        super::accumulate_paragraphs(&paras, config.max_chars, 0)
    }
}

impl ChunkStrategy for FinancialTablesStrategy {
    fn name(&self) -> &'static str {
        "financial_tables"
    }

    fn description(&self) -> &'static str {
        "Optimized for financial documents with tables and numbers (annual reports, quotes, contracts)"
    }

    fn default_config(&self) -> Value {
        json!({
            "max_chars": 1500,
            "overlap": 100,
            "table_mode": "hybrid",
            "preserve_section_headers": true
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.3f32;

        let financial_hits = FINANCIAL_SECTIONS.iter().filter(|p| p.is_match(sample)).count();
        if financial_hits >= 2 {
            score += 0.3;
        } else if financial_hits == 1 {
            score += 0.15;
        }

        let contract_hits = CONTRACT_SECTIONS.iter().filter(|p| p.is_match(sample)).count();
        if contract_hits >= 2 {
            score += 0.2;
        }

        let kpi_hits = KPI_PATTERNS.iter().filter(|p| p.is_match(sample)).count();
        if kpi_hits >= 3 {
            score += 0.2;
        }

        let table_lines = sample.lines().filter(|l| is_table_line(l)).count();
        if table_lines > 3 {
            score += 0.2;
        }

        let decimals = DECIMAL_NUMBER.find_iter(sample).count();
        let currency = CURRENCY.find_iter(sample).count();
        if decimals > 10 || currency > 5 {
            score += 0.15;
        }

        let years: std::collections::HashSet<&str> =
            YEAR.find_iter(sample).map(|m| m.as_str()).collect();
        if years.len() >= 2 {
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
        let preserve_headers = config.bool_param("preserve_section_headers", true);
        let sections = Self::split_sections(text);

        let mut chunks: Vec<String> = Vec::new();
        for (header, content) in &sections {
            for (is_table, part) in Self::extract_parts(content) {
                if is_table {
                    chunks.extend(Self::chunk_table(&part, header, config));
                } else {
                    let prefixed = if preserve_headers && !header.is_empty() {
                        format!("[{}]\n\n{}", header, part.trim())
                    } else {
                        part.trim().to_string()
                    };
                    if prefixed.len() > config.max_chars {
                        chunks.extend(Self::chunk_prose(&prefixed, config));
                    } else if !prefixed.trim().is_empty() {
                        chunks.push(prefixed);
                    }
                }
            }
        }

        if chunks.is_empty() {
            chunks = Self::chunk_prose(text, config);
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BALANCE: &str = "Balans per 31 december\n\
        | Post | 2023 | 2024 |\n\
        |------|------|------|\n\
        | Activa | 100 | 120 |\n\
        | Passiva | 80 | 95 |\n\
        \n\
        Toelichting\n\
        De activa zijn gestegen door investeringen in materieel.";

    #[test]
    fn test_sections_detected() {
        let sections = FinancialTablesStrategy::split_sections(BALANCE);
        assert!(sections.len() >= 2);
        assert!(sections[0].0.to_lowercase().contains("balans"));
    }

    #[test]
    fn test_small_table_row_per_chunk() {
        let chunks = FinancialTablesStrategy.chunk(BALANCE, &ChunkConfig::new(1500, 0));
        let table_chunks: Vec<&String> = chunks.iter().filter(|c| c.contains("[TABEL]")).collect();
        assert_eq!(table_chunks.len(), 2, "one chunk per data row");
        assert!(table_chunks[0].contains("| Activa | 100 | 120 |"));
        assert!(table_chunks[0].contains("| Post | 2023 | 2024 |"), "row chunk keeps header");
        // Section header carried on table chunks
        assert!(table_chunks[0].starts_with("[Balans"));
    }

    #[test]
    fn test_large_table_kpi_mode() {
        let mut table = String::from("Resultatenrekening\nKPI\t2022\t2023\t2024\n");
        for i in 0..25 {
            table.push_str(&format!("Metric{}\t{}\t{}\t{}\n", i, i * 10, i * 11, i * 12));
        }
        let mut config = ChunkConfig::new(1500, 0);
        config.extra.insert("table_mode".into(), json!("hybrid"));
        let chunks = FinancialTablesStrategy.chunk(&table, &config);
        let kpi_chunks: Vec<&String> = chunks.iter().filter(|c| c.contains("KPI: ")).collect();
        assert!(kpi_chunks.len() >= 20, "expected KPI-per-chunk mode, got {:?}", chunks.len());
        assert!(kpi_chunks[0].contains("2022:"));
        assert!(kpi_chunks[0].contains("2024:"));
    }

    #[test]
    fn test_prose_keeps_section_header() {
        let chunks = FinancialTablesStrategy.chunk(BALANCE, &ChunkConfig::new(1500, 0));
        let prose: Vec<&String> = chunks
            .iter()
            .filter(|c| c.contains("gestegen door investeringen"))
            .collect();
        assert_eq!(prose.len(), 1);
        assert!(prose[0].starts_with("[Toelichting]"));
    }

    #[test]
    fn test_applicability_on_financial_text() {
        let strategy = FinancialTablesStrategy;
        let score = strategy.applicability(BALANCE, None);
        assert!(score > 0.6, "financial doc should score high, got {}", score);

        let prose = "A walk in the park on a sunny afternoon is pleasant.";
        assert!(strategy.applicability(prose, None) < score);
    }

    #[test]
    fn test_no_sections_falls_back_to_paragraphs() {
        let text = "Gewone alinea zonder financiële termen.\n\nNog een alinea.";
        let chunks = FinancialTablesStrategy.chunk(text, &ChunkConfig::new(1500, 0));
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_parse_time_series() {
        let header = "Post\t2023\t2024";
        let rows = vec!["Omzet\t100\t120", "Kosten\t60\t70"];
        let parsed = FinancialTablesStrategy::parse_time_series(header, &rows).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "Omzet");
        assert_eq!(parsed[0].1[0], ("2023".to_string(), "100".to_string()));
    }
}
