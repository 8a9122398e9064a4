//! Text normalization and hashing helpers
//!
//! Document identity is based on a SHA-256 hash of the normalized text:
//! Unicode NFC followed by whitespace collapse, so formatting-only changes
//! do not invalidate an unchanged document.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Normalize text for hashing: NFC + collapse whitespace runs to one space
pub fn normalize_for_hash(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let mut out = String::with_capacity(nfc.len());
    let mut in_whitespace = false;
    for ch in nfc.chars() {
        if ch.is_whitespace() {
            if !in_whitespace && !out.is_empty() {
                out.push(' ');
            }
            in_whitespace = true;
        } else {
            out.push(ch);
            in_whitespace = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// SHA-256 hex digest
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a document's normalized text
pub fn doc_hash(text: &str) -> String {
    sha256_hex(&normalize_for_hash(text))
}

/// Hash of a raw chunk text
pub fn chunk_hash(text: &str) -> String {
    sha256_hex(text)
}

/// Sanitize a key component for use in a filename
pub fn path_safe(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_for_hash("a  b\n\nc\td"), "a b c d");
        assert_eq!(normalize_for_hash("  leading and trailing  "), "leading and trailing");
        assert_eq!(normalize_for_hash(""), "");
        assert_eq!(normalize_for_hash("   \n\t "), "");
    }

    #[test]
    fn test_normalize_nfc() {
        // e + combining acute vs precomposed é normalize to the same string
        let decomposed = "e\u{0301}";
        let precomposed = "\u{00e9}";
        assert_eq!(normalize_for_hash(decomposed), normalize_for_hash(precomposed));
    }

    #[test]
    fn test_doc_hash_insensitive_to_formatting() {
        let a = doc_hash("Hello   world.\n\nSecond paragraph.");
        let b = doc_hash("Hello world. Second paragraph.");
        assert_eq!(a, b);

        let c = doc_hash("Hello world. Different paragraph.");
        assert_ne!(a, c);
    }

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe("tenant/a:b"), "tenant_a_b");
        assert_eq!(path_safe("clean-name_1"), "clean-name_1");
    }
}
