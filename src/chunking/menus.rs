//! Menu chunking strategy
//!
//! One dish = one chunk. Parses structured (`Gerecht: ... Prijs: ...`) input
//! or loosely formatted blocks with a trailing price, and can emit per-section
//! summary chunks on top of the item chunks.

use super::{ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;

static STRUCTURED_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(?:gerecht|dish|item)\s*:\s*([^\n]+)\n.*?(?:prijs|price)\s*:\s*([€$£]?\s*[\d.,]+)").unwrap()
});

static DESCRIPTION_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:omschrijving|description)\s*:\s*([^\n]+)").unwrap());

static PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[€$£]?\s*(\d+[.,]\d{2})(?:\s*(?:EUR|USD|euro))?").unwrap());

static SECTION_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:===.*===|#{1,3}\s+.*)$").unwrap());

static PRICE_WITH_CURRENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[€$£]\s*\d+[.,]\d{2}|\d+[.,]\d{2}\s*(?:EUR|USD|euro)").unwrap());

static MENU_SECTIONS: Lazy<Vec<(&'static str, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        ("voorgerecht", vec!["voorgerecht", "starter", "appetizer", "vooraf", "amuse"]),
        ("hoofdgerecht", vec!["hoofdgerecht", "main", "hoofdgerechten"]),
        ("bijgerecht", vec!["bijgerecht", "side", "garnering", "bijgerechten"]),
        ("nagerecht", vec!["nagerecht", "dessert", "toetje", "zoet"]),
        ("dranken", vec!["dranken", "drinks", "beverages", "drankjes"]),
        ("wijnen", vec!["wijnen", "wine", "wijnkaart"]),
        ("lunch", vec!["lunch", "lunchgerechten"]),
        ("diner", vec!["diner", "dinner", "avondkaart"]),
    ]
});

const CULINARY_WORDS: &[&str] = &["gerecht", "ingredient", "bereid", "geserveerd", "menu", "kaart"];
const FILENAME_HINTS: &[&str] = &["menu", "kaart", "gerecht", "dish", "food"];

#[derive(Debug, Clone)]
struct MenuItem {
    name: String,
    description: String,
    price: Option<f64>,
    section: String,
}

pub struct MenusStrategy;

impl MenusStrategy {
    fn parse_price(text: &str) -> Option<f64> {
        PRICE
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', ".").parse().ok())
    }

    fn detect_section(text: &str) -> String {
        let lower = text.to_lowercase();
        for (section, keywords) in MENU_SECTIONS.iter() {
            if keywords.iter().any(|kw| lower.contains(kw)) {
                return section.to_string();
            }
        }
        "overig".to_string()
    }

    fn extract_items(text: &str) -> Vec<MenuItem> {
        // Structured format first
        let mut items: Vec<MenuItem> = STRUCTURED_ITEM
            .captures_iter(text)
            .map(|caps| {
                let full = caps.get(0).unwrap().as_str();
                MenuItem {
                    name: caps.get(1).unwrap().as_str().trim().to_string(),
                    description: DESCRIPTION_FIELD
                        .captures(full)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default(),
                    price: caps.get(2).and_then(|m| Self::parse_price(m.as_str())),
                    section: Self::detect_section(full),
                }
            })
            .collect();
        if !items.is_empty() {
            return items;
        }

        // Loose format: blocks with a name line and a trailing price line
        for block in text.split("\n\n") {
            let lines: Vec<&str> = block.trim().lines().collect();
            if lines.is_empty() {
                continue;
            }
            let first = lines[0].trim();
            if SECTION_HEADER.is_match(first) {
                continue;
            }

            let mut price = None;
            let mut description = String::new();
            for line in &lines[1..] {
                if let Some(found) = Self::parse_price(line) {
                    price = Some(found);
                } else {
                    description.push_str(line.trim());
                    description.push(' ');
                }
            }

            if let Some(price) = price {
                items.push(MenuItem {
                    name: first.to_string(),
                    description: description.trim().to_string(),
                    price: Some(price),
                    section: Self::detect_section(block),
                });
            }
        }
        items
    }

    fn format_item(item: &MenuItem) -> String {
        let mut parts = vec!["[MENU ITEM]".to_string(), String::new()];
        parts.push(format!("Gerecht: {}", item.name));
        parts.push(format!("Categorie: {}", item.section));
        if !item.description.is_empty() {
            parts.push(format!("Omschrijving: {}", item.description));
        }
        if let Some(price) = item.price {
            parts.push(format!("Prijs: {:.2} EUR", price));
        }
        parts.join("\n")
    }

    fn section_summaries(items: &[MenuItem]) -> Vec<String> {
        let mut by_section: BTreeMap<&str, Vec<&MenuItem>> = BTreeMap::new();
        for item in items {
            by_section.entry(item.section.as_str()).or_default().push(item);
        }

        by_section
            .into_iter()
            .filter(|(_, items)| items.len() >= 2)
            .map(|(section, items)| {
                let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
                let prices: Vec<f64> = items.iter().filter_map(|i| i.price).collect();
                let mut summary = format!(
                    "[MENU SECTIE: {}]\n\n{} gerechten: {}",
                    section,
                    items.len(),
                    names.join(", ")
                );
                if !prices.is_empty() {
                    let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    summary.push_str(&format!("\nPrijzen van {:.2} tot {:.2} EUR", min, max));
                }
                summary
            })
            .collect()
    }
}

impl ChunkStrategy for MenusStrategy {
    fn name(&self) -> &'static str {
        "menus"
    }

    fn description(&self) -> &'static str {
        "Optimized for menu/dish data: restaurants, catering (1 dish = 1 chunk)"
    }

    fn default_config(&self) -> Value {
        json!({
            "max_chars": 800,
            "overlap": 0,
            "min_item_length": 5,
            "section_summaries": true
        })
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.3f32;

        let price_count = PRICE_WITH_CURRENCY.find_iter(sample).count();
        if price_count >= 3 {
            score += 0.25;
        } else if price_count >= 1 {
            score += 0.15;
        }

        let lower = sample.to_lowercase();
        let section_hits: usize = MENU_SECTIONS
            .iter()
            .map(|(_, kws)| kws.iter().filter(|kw| lower.contains(*kw)).count())
            .sum();
        if section_hits >= 2 {
            score += 0.2;
        }

        let culinary = CULINARY_WORDS.iter().filter(|w| lower.contains(*w)).count();
        if culinary >= 2 {
            score += 0.15;
        }

        if STRUCTURED_ITEM.find_iter(sample).count() >= 2 {
            score += 0.2;
        }

        if let Some(meta) = metadata {
            if matches!(meta.doc_type.as_deref(), Some("menu" | "menu_item" | "dish")) {
                score += 0.3;
            }
            let fname = meta.filename_lower();
            if FILENAME_HINTS.iter().any(|h| fname.contains(h)) {
                score += 0.15;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let min_item_length = config.usize_param("min_item_length", 5);
        let with_summaries = config.bool_param("section_summaries", true);

        let items = Self::extract_items(text);
        if items.is_empty() {
            let trimmed = text.trim();
            return if trimmed.is_empty() { vec![] } else { vec![trimmed.to_string()] };
        }

        let kept: Vec<&MenuItem> = items
            .iter()
            .filter(|item| item.name.len() >= min_item_length)
            .collect();

        let mut chunks: Vec<String> = kept.iter().map(|item| Self::format_item(item)).collect();
        if with_summaries {
            let owned: Vec<MenuItem> = kept.into_iter().cloned().collect();
            chunks.extend(Self::section_summaries(&owned));
        }

        if chunks.is_empty() && !text.trim().is_empty() {
            return vec![text.trim().to_string()];
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRUCTURED_MENU: &str = "Gerecht: Tomatensoep\nOmschrijving: Verse soep met basilicum\nPrijs: 6,50\n\n\
        Gerecht: Biefstuk van de grill\nOmschrijving: Met friet en salade\nPrijs: 24,00";

    #[test]
    fn test_structured_items_one_chunk_each() {
        let chunks = MenusStrategy.chunk(STRUCTURED_MENU, &ChunkConfig::new(800, 0));
        let item_chunks: Vec<&String> = chunks.iter().filter(|c| c.starts_with("[MENU ITEM]")).collect();
        assert_eq!(item_chunks.len(), 2);
        assert!(item_chunks[0].contains("Gerecht: Tomatensoep"));
        assert!(item_chunks[0].contains("Prijs: 6.50 EUR"));
        assert!(item_chunks[1].contains("Biefstuk"));
    }

    #[test]
    fn test_loose_format_with_trailing_price() {
        let text = "=== Hoofdgerechten ===\n\nZalm uit de oven\nMet seizoensgroenten\n€ 21,50\n\nVegetarische lasagne\n18,00 EUR";
        let chunks = MenusStrategy.chunk(text, &ChunkConfig::new(800, 0));
        let item_chunks: Vec<&String> = chunks.iter().filter(|c| c.starts_with("[MENU ITEM]")).collect();
        assert_eq!(item_chunks.len(), 2);
        assert!(item_chunks[0].contains("Zalm uit de oven"));
        assert!(item_chunks[0].contains("21.50"));
    }

    #[test]
    fn test_section_summaries_emitted() {
        let text = "Gerecht: Soep vooraf als starter\nPrijs: 6,00\n\nGerecht: Carpaccio als starter vooraf\nPrijs: 12,00";
        let chunks = MenusStrategy.chunk(text, &ChunkConfig::new(800, 0));
        assert!(
            chunks.iter().any(|c| c.starts_with("[MENU SECTIE:")),
            "expected a section summary chunk in {:?}",
            chunks
        );
    }

    #[test]
    fn test_no_items_returns_whole_text() {
        let text = "Gewoon een stuk tekst zonder gerechten of prijzen.";
        let chunks = MenusStrategy.chunk(text, &ChunkConfig::new(800, 0));
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_price_parsing() {
        assert_eq!(MenusStrategy::parse_price("€ 12,50"), Some(12.5));
        assert_eq!(MenusStrategy::parse_price("9.99 EUR"), Some(9.99));
        assert_eq!(MenusStrategy::parse_price("geen prijs"), None);
    }

    #[test]
    fn test_applicability_on_menu() {
        let strategy = MenusStrategy;
        let score = strategy.applicability(STRUCTURED_MENU, None);
        assert!(score >= 0.6, "menu should score high, got {}", score);
    }
}
