//! Conversation turn chunking strategy
//!
//! For chat logs and coaching transcripts: splits on speaker prefixes
//! (`User:`, `Coach:`, `Vraag:`, ...) and merges small turns up to the
//! configured chunk size so single-line exchanges stay together.

use super::{accumulate_paragraphs, split_paragraphs, ChunkConfig, ChunkStrategy, StrategyMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static SPEAKER_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^(?:User|Assistant|Client|Therapist|Coach|Coachee|Q|A|Vraag|Antwoord)\s*:").unwrap()
});

pub struct ConversationTurnsStrategy;

impl ConversationTurnsStrategy {
    fn split_turns(text: &str) -> Vec<String> {
        let mut boundaries: Vec<usize> = SPEAKER_PREFIX.find_iter(text).map(|m| m.start()).collect();
        if boundaries.is_empty() {
            return vec![];
        }
        // Text before the first speaker belongs to a preamble turn
        if boundaries[0] > 0 && !text[..boundaries[0]].trim().is_empty() {
            boundaries.insert(0, 0);
        }

        let mut turns = Vec::new();
        for (i, &start) in boundaries.iter().enumerate() {
            let end = boundaries.get(i + 1).copied().unwrap_or(text.len());
            let turn = text[start..end].trim();
            if !turn.is_empty() {
                turns.push(turn.to_string());
            }
        }
        turns
    }

    /// Merge consecutive turns into chunks of at most `max_chars`
    fn merge_turns(turns: Vec<String>, max_chars: usize) -> Vec<String> {
        let mut merged = Vec::new();
        let mut buf = String::new();
        for turn in turns {
            if buf.is_empty() {
                buf = turn;
            } else if buf.len() + turn.len() + 2 <= max_chars {
                buf.push_str("\n\n");
                buf.push_str(&turn);
            } else {
                merged.push(buf);
                buf = turn;
            }
        }
        if !buf.is_empty() {
            merged.push(buf);
        }
        merged
    }
}

impl ChunkStrategy for ConversationTurnsStrategy {
    fn name(&self) -> &'static str {
        "conversation_turns"
    }

    fn description(&self) -> &'static str {
        "Splits chat logs on speaker prefixes; small turns are merged up to max_chars"
    }

    fn default_config(&self) -> Value {
        json!({"max_chars": 600, "overlap": 0, "split_on_turns": true})
    }

    fn applicability(&self, sample: &str, metadata: Option<&StrategyMetadata>) -> f32 {
        let mut score = 0.2f32;

        let speaker_count = SPEAKER_PREFIX.find_iter(sample).count();
        if speaker_count >= 4 {
            score += 0.5;
        } else if speaker_count >= 2 {
            score += 0.3;
        }

        if let Some(meta) = metadata {
            if matches!(
                meta.doc_type.as_deref(),
                Some("coaching_chat") | Some("coaching_doc") | Some("chatlog")
            ) {
                score += 0.25;
            }
            let fname = meta.filename_lower();
            if fname.contains("chat") || fname.contains("sessie") || fname.contains("transcript") {
                score += 0.1;
            }
        }

        score.clamp(0.0, 1.0)
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Vec<String> {
        let turns = Self::split_turns(text);
        if turns.is_empty() {
            let paras = split_paragraphs(text);
            return accumulate_paragraphs(&paras, config.max_chars, config.overlap);
        }
        Self::merge_turns(turns, config.max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_speakers() {
        let text = "Coach: How was your week?\nCoachee: Quite busy, actually. I had three deadlines.\nCoach: Tell me more about that.\nCoachee: It started on Monday with the report.";
        let chunks = ConversationTurnsStrategy.chunk(text, &ChunkConfig::new(60, 0));
        assert!(chunks.len() >= 2);
        // Every chunk starts with a speaker prefix
        for chunk in &chunks {
            assert!(SPEAKER_PREFIX.is_match(chunk), "chunk missing speaker: {:?}", chunk);
        }
    }

    #[test]
    fn test_small_turns_merge() {
        let text = "Q: One?\nA: Yes.\nQ: Two?\nA: No.";
        let chunks = ConversationTurnsStrategy.chunk(text, &ChunkConfig::new(600, 0));
        assert_eq!(chunks.len(), 1, "tiny turns should merge into one chunk");
        assert!(chunks[0].contains("Q: One?"));
        assert!(chunks[0].contains("A: No."));
    }

    #[test]
    fn test_dutch_speakers() {
        let text = "Vraag: Wat is de planning?\nAntwoord: Volgende week starten we.\nVraag: En daarna?\nAntwoord: Dan volgt de evaluatie.";
        let turns = ConversationTurnsStrategy::split_turns(text);
        assert_eq!(turns.len(), 4);
    }

    #[test]
    fn test_no_speakers_falls_back() {
        let text = "Just a paragraph.\n\nAnother paragraph.";
        let chunks = ConversationTurnsStrategy.chunk(text, &ChunkConfig::new(600, 0));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_preamble_kept() {
        let text = "Session notes from March.\nCoach: Shall we begin?\nCoachee: Sure.";
        let turns = ConversationTurnsStrategy::split_turns(text);
        assert!(turns[0].contains("Session notes"));
    }
}
