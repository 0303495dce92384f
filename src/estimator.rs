// estimator.rs
// Token Estimator (spec §4.2): a pure, deterministic char→token heuristic,
// injected wherever budget math happens so it can be swapped without
// touching stored data.

use crate::model::{Message, MessagePart};

/// A deterministic, monotone-non-decreasing, side-effect-free text→token estimator.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> usize;

    fn estimate_message(&self, message: &Message) -> usize {
        self.estimate_text(&message.content_text)
    }

    fn estimate_parts(&self, parts: &[MessagePart]) -> usize {
        parts
            .iter()
            .map(|p| {
                p.token_count.unwrap_or_else(|| {
                    p.text_content
                        .as_deref()
                        .map(|t| self.estimate_text(t))
                        .unwrap_or(0) as i64
                }) as usize
            })
            .sum()
    }
}

/// Default estimator: `ceil(len_chars / 4)`, the conservative heuristic used
/// across the spec's budget math. Counts Unicode scalar values, not bytes, so
/// it stays monotone and locale-independent.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharDiv4Estimator;

impl TokenEstimator for CharDiv4Estimator {
    fn estimate_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_is_zero_tokens() {
        assert_eq!(CharDiv4Estimator.estimate_text(""), 0);
    }

    #[test]
    fn test_ceil_division() {
        assert_eq!(CharDiv4Estimator.estimate_text("abcd"), 1);
        assert_eq!(CharDiv4Estimator.estimate_text("abcde"), 2);
    }

    #[test]
    fn test_monotone_non_decreasing() {
        let est = CharDiv4Estimator;
        let a = est.estimate_text("hello");
        let b = est.estimate_text("hello world");
        assert!(b >= a);
    }

    #[test]
    fn test_unicode_counts_scalars_not_bytes() {
        // "é" is 2 bytes in UTF-8 but 1 scalar value.
        let est = CharDiv4Estimator;
        assert_eq!(est.estimate_text("éééé"), 1);
    }
}
