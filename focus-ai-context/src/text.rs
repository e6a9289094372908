//! Overlapping, token-bounded text windows for retrieval.
//!
//! A parent chunk is usually far larger than what an embedding model handles well, so it is cut
//! into *windows*: runs of text bounded by a target token count, where each window repeats a
//! small tail of the previous one so that a sentence straddling the boundary stays retrievable.
//!
//! Splitting is structure-aware. The text is first broken into atomic segments by a ranked list of
//! delimiter patterns (headings, fences, paragraphs, sentences, spaces); a segment is only split
//! with a weaker delimiter when it alone exceeds the target. Windows are then packed greedily from
//! whole segments, so a window never ends in the middle of a word unless a single word is larger
//! than the target.
//!
//! ```
//! use focus_ai_context::text::{TextWindowBuilder, WindowConfig};
//! use focus_ai_context::tokens::WordCountEstimator;
//! use std::sync::Arc;
//!
//! let config = WindowConfig { target_tokens: 8, overlap_fraction: 0.25 };
//! let builder = TextWindowBuilder::plain_text(config, Arc::new(WordCountEstimator)).unwrap();
//!
//! let text = "one two three four five six seven eight nine ten eleven twelve";
//! let windows = builder.windows(text);
//!
//! assert_eq!(windows.len(), 2);
//! assert!(windows.iter().all(|w| w.token_count <= 8));
//! // the second window starts with the tail of the first
//! assert!(windows[1].text.starts_with("seven eight"));
//! ```

use crate::error::TextError;
use crate::tokens::TokenEstimator;
use regex::Regex;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Ranked delimiters for Markdown sources, strongest first.
pub const DEFAULT_MARKDOWN_DELIMITERS: &[&str] = &[
    r"(?m)^\s*#{1,6}\s+.*$", // Headings
    r"```",                  // Code block fences
    r"\n\s*\n",              // Paragraphs
    r"(?m)^\s*[-*+]\s+",     // Unordered list items
    r"(?m)^\s*\d+\.\s+",     // Ordered list items
    r"[.!?。！？]\s*",        // Sentence ends
    r"\n",                   // Line breaks
    r" ",                    // Spaces
];

/// Ranked delimiters for unstructured prose.
pub const PLAIN_TEXT_DELIMITERS: &[&str] = &[
    r"\n\s*\n",       // Paragraphs
    r"[.!?。！？]\s*", // Sentence ends
    r"\n",            // Line breaks
    r" ",             // Spaces
];

/// Pick delimiters by file extension.
pub fn delimiters_for_path(path: &Path) -> &'static [&'static str] {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("md") | Some("markdown") => DEFAULT_MARKDOWN_DELIMITERS,
        _ => PLAIN_TEXT_DELIMITERS,
    }
}

/// Window sizing. `overlap_fraction` is the share of `target_tokens` a window may repeat from
/// the end of its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub struct WindowConfig {
    pub target_tokens: usize,
    pub overlap_fraction: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            overlap_fraction: 0.15,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), TextError> {
        if self.target_tokens == 0 {
            return Err(TextError::InvalidConfig(
                "target_tokens must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.overlap_fraction) {
            return Err(TextError::InvalidConfig(format!(
                "overlap_fraction must be in [0, 1), got {}",
                self.overlap_fraction
            )));
        }
        Ok(())
    }

    fn overlap_budget(&self) -> usize {
        (self.target_tokens as f32 * self.overlap_fraction).floor() as usize
    }
}

/// One window of a larger text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextWindow {
    /// Position among the windows of the same source text (0-indexed).
    pub index: usize,
    /// Byte range of the window in the source text, before trimming.
    pub range: Range<usize>,
    /// Window text with surrounding whitespace trimmed.
    pub text: String,
    /// Estimated tokens of `text`.
    pub token_count: usize,
}

/// Builds overlapping windows from text using ranked delimiters and an injected estimator.
#[derive(Clone)]
pub struct TextWindowBuilder {
    delimiters: Vec<Regex>,
    config: WindowConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for TextWindowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextWindowBuilder")
            .field("delimiters", &self.delimiters.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TextWindowBuilder {
    /// Compile `delimiter_patterns` (strongest first) into a builder.
    pub fn new(
        delimiter_patterns: &[&str],
        config: WindowConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, TextError> {
        config.validate()?;
        let delimiters = delimiter_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            delimiters,
            config,
            estimator,
        })
    }

    pub fn plain_text(
        config: WindowConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, TextError> {
        Self::new(PLAIN_TEXT_DELIMITERS, config, estimator)
    }

    pub fn markdown(
        config: WindowConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, TextError> {
        Self::new(DEFAULT_MARKDOWN_DELIMITERS, config, estimator)
    }

    pub fn for_path(
        path: &Path,
        config: WindowConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, TextError> {
        Self::new(delimiters_for_path(path), config, estimator)
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Cut `text` into overlapping windows. Whitespace-only windows are dropped, so empty input
    /// yields no windows.
    pub fn windows(&self, text: &str) -> Vec<TextWindow> {
        let segments = self.split_recursively_into_segments(text, 0, 0);
        let costs: Vec<usize> = segments
            .iter()
            .map(|range| self.estimator.estimate(&text[range.clone()]))
            .collect();

        let target = self.config.target_tokens;
        let overlap_budget = self.config.overlap_budget();
        let mut windows = Vec::new();
        let mut start = 0;

        while start < segments.len() {
            let mut end = start;
            let mut tokens = 0;
            while end < segments.len() && (end == start || tokens + costs[end] <= target) {
                tokens += costs[end];
                end += 1;
            }

            let range = segments[start].start..segments[end - 1].end;
            let window_text = text[range.clone()].trim();
            if !window_text.is_empty() {
                windows.push(TextWindow {
                    index: windows.len(),
                    range,
                    text: window_text.to_string(),
                    token_count: self.estimator.estimate(window_text),
                });
            }

            if end == segments.len() {
                break;
            }

            // Walk back from the cut while the repeated tail fits the overlap budget.
            let mut next = end;
            let mut repeated = 0;
            while next > start + 1 && repeated + costs[next - 1] <= overlap_budget {
                repeated += costs[next - 1];
                next -= 1;
            }
            // Never start a window on the whitespace that followed the previous one.
            while next < end && costs[next] == 0 {
                next += 1;
            }
            start = next;
        }

        windows
    }

    // Returns byte ranges of "atomic" segments: pieces that fit the target on their own or could
    // not be split further, plus the matched delimiters themselves.
    fn split_recursively_into_segments(
        &self,
        text: &str,
        delimiter_idx: usize,
        current_offset: usize,
    ) -> Vec<Range<usize>> {
        let mut result_segments: Vec<Range<usize>> = Vec::new();

        if text.is_empty() {
            return result_segments;
        }

        if self.estimator.estimate(text) <= self.config.target_tokens {
            result_segments.push(current_offset..current_offset + text.len());
            return result_segments;
        }

        // Out of delimiters: cut on character boundaries.
        if delimiter_idx >= self.delimiters.len() {
            let mut piece_start = 0;
            let mut last_fit = 0;
            for (idx, ch) in text.char_indices() {
                let candidate_end = idx + ch.len_utf8();
                if self.estimator.estimate(&text[piece_start..candidate_end])
                    > self.config.target_tokens
                    && last_fit > piece_start
                {
                    result_segments.push(current_offset + piece_start..current_offset + last_fit);
                    piece_start = last_fit;
                }
                last_fit = candidate_end;
            }
            if piece_start < text.len() {
                result_segments.push(current_offset + piece_start..current_offset + text.len());
            }
            return result_segments;
        }

        let current_delimiter = &self.delimiters[delimiter_idx];
        let mut local_byte_start = 0;

        for mat in current_delimiter.find_iter(text) {
            if mat.start() > local_byte_start {
                let sub_text = &text[local_byte_start..mat.start()];
                result_segments.extend(self.split_recursively_into_segments(
                    sub_text,
                    delimiter_idx + 1,
                    current_offset + local_byte_start,
                ));
            }
            if !mat.range().is_empty() {
                result_segments.push(current_offset + mat.start()..current_offset + mat.end());
            }
            local_byte_start = mat.end();
        }

        if local_byte_start < text.len() {
            let sub_text = &text[local_byte_start..];
            result_segments.extend(self.split_recursively_into_segments(
                sub_text,
                delimiter_idx + 1,
                current_offset + local_byte_start,
            ));
        }

        result_segments
    }
}
