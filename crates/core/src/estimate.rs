//! Approximate prompt size against per-target limits.
//!
//! Counts are estimates: tokens are derived from character counts, not from
//! a real tokenizer. Exceeding a limit is advisory and never blocks a copy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::helpers::split_lines;
use crate::Tokenizer;

/// Key of the fallback entry in a [`LimitsTable`].
pub const DEFAULT_LIMITS_KEY: &str = "default";

/// Size limits of one target (model profile). `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizeLimits {
    pub max_lines: usize,
    pub max_tokens: usize,
    pub approx_chars_per_token: f64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            max_tokens: 12000,
            approx_chars_per_token: 3.5,
        }
    }
}

impl SizeLimits {
    pub fn unlimited() -> Self {
        Self {
            max_lines: 0,
            max_tokens: 0,
            ..Self::default()
        }
    }

    /// Characters per token, floored at 1.
    pub fn chars_per_token(&self) -> f64 {
        if self.approx_chars_per_token.is_finite() {
            self.approx_chars_per_token.max(1.0)
        } else {
            1.0
        }
    }
}

/// Limits keyed by target id, with a `default` fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitsTable(pub BTreeMap<String, SizeLimits>);

impl Default for LimitsTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(DEFAULT_LIMITS_KEY.to_string(), SizeLimits::default());
        Self(table)
    }
}

impl LimitsTable {
    /// Limits for `target`, else the `default` entry, else unlimited.
    pub fn resolve(&self, target: &str) -> SizeLimits {
        self.0
            .get(target)
            .or_else(|| self.0.get(DEFAULT_LIMITS_KEY))
            .copied()
            .unwrap_or_else(SizeLimits::unlimited)
    }
}

/// Token estimate from a fixed characters-per-token ratio.
#[derive(Debug, Clone, Copy)]
pub struct CharApproxTokenizer {
    chars_per_token: f64,
}

impl CharApproxTokenizer {
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() {
            chars_per_token.max(1.0)
        } else {
            1.0
        };
        Self { chars_per_token }
    }
}

impl Tokenizer for CharApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Dimension whose limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exceeded {
    Lines,
    Tokens,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimate {
    pub lines_count: usize,
    pub approx_tokens_count: usize,
    pub max_lines: usize,
    pub max_tokens: usize,
    pub exceeded_by: BTreeSet<Exceeded>,
}

/// Number of lines in `text`. A single trailing line break does not start
/// another line, so `"a\nb\n"` has two lines.
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let segments = split_lines(text);
    match segments.last() {
        Some(last) if last.is_empty() => segments.len() - 1,
        _ => segments.len(),
    }
}

/// Estimate `text` with the character-ratio tokenizer implied by `limits`.
pub fn estimate(text: &str, limits: &SizeLimits) -> SizeEstimate {
    estimate_with(text, limits, &CharApproxTokenizer::new(limits.chars_per_token()))
}

/// Estimate `text` with an arbitrary tokenizer.
pub fn estimate_with<T: Tokenizer>(text: &str, limits: &SizeLimits, tokenizer: &T) -> SizeEstimate {
    let lines_count = count_lines(text);
    let approx_tokens_count = tokenizer.count_tokens(text);

    let mut exceeded_by = BTreeSet::new();
    if limits.max_lines != 0 && lines_count > limits.max_lines {
        exceeded_by.insert(Exceeded::Lines);
    }
    if limits.max_tokens != 0 && approx_tokens_count > limits.max_tokens {
        exceeded_by.insert(Exceeded::Tokens);
    }

    SizeEstimate {
        lines_count,
        approx_tokens_count,
        max_lines: limits.max_lines,
        max_tokens: limits.max_tokens,
        exceeded_by,
    }
}

fn limit_label(limit: usize) -> String {
    if limit == 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

impl SizeEstimate {
    pub fn is_exceeded(&self) -> bool {
        !self.exceeded_by.is_empty()
    }

    fn exceeded_list(&self) -> String {
        self.exceeded_by
            .iter()
            .map(|e| match e {
                Exceeded::Lines => "lines",
                Exceeded::Tokens => "tokens",
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// One-line notification text, e.g. for a status message after copying.
    pub fn summary_line(&self, command: &str) -> String {
        let mut line = format!(
            "[{}] Context size: {} line(s), ~{} token(s) (maxLines={}, maxTokens={})",
            command,
            self.lines_count,
            self.approx_tokens_count,
            limit_label(self.max_lines),
            limit_label(self.max_tokens)
        );
        if self.is_exceeded() {
            line.push_str(" Exceeded by: ");
            line.push_str(&self.exceeded_list());
        }
        line
    }

    /// Stats block appended to a copied prompt.
    pub fn footer_text(&self) -> String {
        let mut footer = format!(
            "[CONTEXT STATS] Lines: {} | Tokens (approx): {}\nMax lines: {} | Max tokens: {}",
            self.lines_count,
            self.approx_tokens_count,
            limit_label(self.max_lines),
            limit_label(self.max_tokens)
        );
        if self.is_exceeded() {
            footer.push_str("\nExceeded by: ");
            footer.push_str(&self.exceeded_list());
        }
        footer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn test_line_limit_boundary() {
        let limits = SizeLimits {
            max_lines: 10,
            max_tokens: 0,
            approx_chars_per_token: 4.0,
        };
        assert!(estimate(&lines(10), &limits).exceeded_by.is_empty());

        let over = estimate(&lines(11), &limits);
        assert_eq!(over.exceeded_by, BTreeSet::from([Exceeded::Lines]));
    }

    #[test]
    fn test_trailing_newline_not_counted() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("a"), 1);
        assert_eq!(count_lines("a\nb\n"), 2);
        assert_eq!(count_lines("a\r\nb\r\n\n"), 3);
        assert_eq!(count_lines("\n"), 1);
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        let limits = SizeLimits {
            approx_chars_per_token: 4.0,
            ..SizeLimits::unlimited()
        };
        assert_eq!(estimate("", &limits).approx_tokens_count, 0);
        assert_eq!(estimate("abcd", &limits).approx_tokens_count, 1);
        assert_eq!(estimate("abcde", &limits).approx_tokens_count, 2);
        // characters, not bytes
        assert_eq!(estimate("ééééé", &limits).approx_tokens_count, 2);
    }

    #[test]
    fn test_chars_per_token_floor() {
        let limits = SizeLimits {
            approx_chars_per_token: 0.0,
            ..SizeLimits::unlimited()
        };
        assert_eq!(estimate("abc", &limits).approx_tokens_count, 3);
        assert_eq!(CharApproxTokenizer::new(f64::NAN).count_tokens("ab"), 2);
    }

    #[test]
    fn test_zero_limits_never_exceeded() {
        let text = "x".repeat(100_000);
        assert!(!estimate(&text, &SizeLimits::unlimited()).is_exceeded());
    }

    #[test]
    fn test_token_limit_exceeded() {
        let limits = SizeLimits {
            max_lines: 0,
            max_tokens: 2,
            approx_chars_per_token: 1.0,
        };
        let est = estimate("abc", &limits);
        assert_eq!(est.exceeded_by, BTreeSet::from([Exceeded::Tokens]));
        assert_eq!(
            est.footer_text(),
            "[CONTEXT STATS] Lines: 1 | Tokens (approx): 3\nMax lines: unlimited | Max tokens: 2\nExceeded by: tokens"
        );
        assert_eq!(
            est.summary_line("Copy"),
            "[Copy] Context size: 1 line(s), ~3 token(s) (maxLines=unlimited, maxTokens=2) Exceeded by: tokens"
        );
    }

    #[test]
    fn test_limits_table_fallback() {
        let mut table = LimitsTable::default();
        table.0.insert(
            "gemini".to_string(),
            SizeLimits {
                max_lines: 5000,
                ..SizeLimits::default()
            },
        );
        assert_eq!(table.resolve("gemini").max_lines, 5000);
        assert_eq!(table.resolve("unknown").max_lines, 1000);
        assert_eq!(LimitsTable(BTreeMap::new()).resolve("x"), SizeLimits::unlimited());
    }

    #[test]
    fn test_serialized_exceeded_names() {
        let json = serde_json::to_string(&Exceeded::Lines).unwrap();
        assert_eq!(json, "\"LINES\"");
    }
}
