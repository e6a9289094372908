//! Token estimation used for window sizing and context budgeting.
//!
//! Model tokenizers differ, so the rest of the workspace never counts tokens itself: it asks a
//! [`TokenEstimator`]. The default [`HeuristicTokenEstimator`] is deliberately cheap and
//! deterministic; a model-specific tokenizer can be injected wherever an estimator is accepted.
//!
//! ```
//! use focus_ai_context::tokens::{HeuristicTokenEstimator, TokenEstimator};
//!
//! let estimator = HeuristicTokenEstimator::default();
//! assert_eq!(estimator.estimate(""), 0);
//! assert_eq!(estimator.estimate("one two three"), 3);
//! // CJK ideographs are counted one token each
//! assert_eq!(estimator.estimate("知识库"), 3);
//! ```

/// Estimates how many model tokens a piece of text occupies.
pub trait TokenEstimator: Send + Sync {
    /// Estimated token count of `text`.
    fn estimate(&self, text: &str) -> usize;
}

/// Word/character heuristic: each whitespace-separated word costs one token per
/// `chars_per_token` characters (at least one), and every CJK character costs one token.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenEstimator {
    pub chars_per_token: usize,
}

impl Default for HeuristicTokenEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl HeuristicTokenEstimator {
    fn word_cost(&self, latin_chars: usize) -> usize {
        if latin_chars == 0 {
            return 0;
        }
        latin_chars.div_ceil(self.chars_per_token.max(1))
    }
}

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        let mut total = 0;
        for word in text.split_whitespace() {
            let mut latin = 0;
            for ch in word.chars() {
                if is_cjk(ch) {
                    total += self.word_cost(latin) + 1;
                    latin = 0;
                } else {
                    latin += 1;
                }
            }
            total += self.word_cost(latin);
        }
        total
    }
}

/// Counts whitespace-separated words. Handy when a test or a caller wants exact, obvious counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountEstimator;

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF   // kana
        | 0x3400..=0x4DBF // CJK extension A
        | 0x4E00..=0x9FFF // CJK unified ideographs
        | 0xAC00..=0xD7AF // hangul syllables
        | 0xF900..=0xFAFF // compatibility ideographs
        | 0xFF00..=0xFFEF // full-width forms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counts_long_words_in_quarters() {
        let estimator = HeuristicTokenEstimator::default();
        assert_eq!(estimator.estimate("a"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate("internationalization"), 5);
    }

    #[test]
    fn test_heuristic_mixed_scripts() {
        let estimator = HeuristicTokenEstimator::default();
        // "Rust" = 1, "语言" = 2
        assert_eq!(estimator.estimate("Rust语言"), 3);
        assert_eq!(estimator.estimate("  \n\t "), 0);
    }

    #[test]
    fn test_word_count_estimator() {
        assert_eq!(WordCountEstimator.estimate("alpha beta\ngamma"), 3);
        assert_eq!(WordCountEstimator.estimate(""), 0);
    }
}
