//! Question fingerprints: the cache and dedup key.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 (hex) of the normalized question text.
///
/// Normalization case-folds and collapses every run of whitespace to a single
/// space, so the same question observed by different accounts (or rendered with
/// different line breaks) always maps to the same fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionFingerprint(String);

impl QuestionFingerprint {
    pub fn of(question: &str) -> Self {
        let mut h = Sha256::new();
        h.update(normalize(question).as_bytes());
        Self(hex(&h.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for QuestionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_under_case_and_whitespace() {
        assert_eq!(
            QuestionFingerprint::of("What is X?"),
            QuestionFingerprint::of("what is x?  ")
        );
        assert_eq!(
            QuestionFingerprint::of("  Which\n planet\tis  RED? "),
            QuestionFingerprint::of("which planet is red?")
        );
    }

    #[test]
    fn different_questions_differ() {
        assert_ne!(
            QuestionFingerprint::of("What is X?"),
            QuestionFingerprint::of("What is Y?")
        );
    }

    #[test]
    fn is_hex_sha256() {
        let fp = QuestionFingerprint::of("anything");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn normalize_folds_unicode_case() {
        assert_eq!(normalize("ÉCOLE  Ünd"), "école ünd");
    }
}
