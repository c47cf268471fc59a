//! Head+tail compaction of over-budget prompts.

use crate::tokenization::estimate_tokens;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptimizationResult {
    pub prompt: String,
    pub original_prompt_tokens: u32,
    pub effective_prompt_tokens: u32,
    pub prompt_truncated: bool,
}

pub struct ContextWindowOptimizer {
    chars_per_token: f64,
    head_ratio: f64,
    marker: String,
}

impl ContextWindowOptimizer {
    pub fn new(chars_per_token: f64, head_ratio: f64, marker: impl Into<String>) -> Self {
        Self {
            chars_per_token,
            head_ratio: head_ratio.clamp(0.10, 0.90),
            marker: marker.into(),
        }
    }

    /// Fits `prompt` into `max_prompt_tokens`, preserving both preamble and
    /// recent context via head+tail compaction rather than uniform truncation.
    pub fn optimize(&self, prompt: &str, max_prompt_tokens: i64) -> ContextOptimizationResult {
        let original_prompt_tokens = estimate_tokens(prompt, self.chars_per_token);

        if max_prompt_tokens <= 0 {
            return ContextOptimizationResult {
                prompt: String::new(),
                original_prompt_tokens,
                effective_prompt_tokens: 0,
                prompt_truncated: true,
            };
        }

        if original_prompt_tokens as i64 <= max_prompt_tokens {
            return ContextOptimizationResult {
                prompt: prompt.to_string(),
                original_prompt_tokens,
                effective_prompt_tokens: original_prompt_tokens,
                prompt_truncated: false,
            };
        }

        let max_chars = ((max_prompt_tokens as f64) * self.chars_per_token).floor().max(1.0) as usize;
        let marker_len = self.marker.chars().count();

        let trimmed = if max_chars <= marker_len + 4 {
            take_chars(prompt, max_chars)
        } else {
            let mut head_chars = ((max_chars as f64) * self.head_ratio).floor() as usize;
            let mut tail_chars = max_chars.saturating_sub(head_chars).saturating_sub(marker_len);
            if tail_chars < 1 {
                tail_chars = 1;
                head_chars = max_chars.saturating_sub(marker_len).saturating_sub(tail_chars).max(1);
            }
            format!(
                "{}{}{}",
                take_chars(prompt, head_chars),
                self.marker,
                take_last_chars(prompt, tail_chars)
            )
        };

        let effective_prompt_tokens = estimate_tokens(&trimmed, self.chars_per_token);
        ContextOptimizationResult {
            prompt: trimmed,
            original_prompt_tokens,
            effective_prompt_tokens,
            prompt_truncated: true,
        }
    }
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn take_last_chars(text: &str, n: usize) -> String {
    let total = text.chars().count();
    let skip = total.saturating_sub(n);
    text.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> ContextWindowOptimizer {
        ContextWindowOptimizer::new(4.0, 0.35, "\n[...context truncated...]\n")
    }

    #[test]
    fn returns_prompt_unchanged_when_within_budget() {
        let prompt = "short prompt";
        let result = optimizer().optimize(prompt, 20);
        assert!(!result.prompt_truncated);
        assert_eq!(result.prompt, prompt);
        assert_eq!(result.original_prompt_tokens, result.effective_prompt_tokens);
    }

    #[test]
    fn truncates_prompt_when_over_budget() {
        let prompt = "A".repeat(400);
        let result = optimizer().optimize(&prompt, 20);
        assert!(result.prompt_truncated);
        assert!(result.effective_prompt_tokens <= 20);
        assert!(result.prompt.contains("[...context truncated...]"));
    }

    #[test]
    fn zero_budget_yields_empty_truncated_prompt() {
        let result = optimizer().optimize("anything", 0);
        assert!(result.prompt_truncated);
        assert_eq!(result.prompt, "");
        assert_eq!(result.effective_prompt_tokens, 0);
    }

    #[test]
    fn tiny_budget_falls_back_to_prefix_only() {
        let prompt = "A".repeat(200);
        // max_chars = 4 * 4 = 16 <= marker_len(27) + 4
        let result = optimizer().optimize(&prompt, 4);
        assert!(result.prompt_truncated);
        assert!(!result.prompt.contains("[...context truncated...]"));
        assert_eq!(result.prompt, "A".repeat(16));
    }

    #[test]
    fn idempotent_once_it_fits() {
        let prompt = "A".repeat(400);
        let opt = optimizer();
        let first = opt.optimize(&prompt, 20);
        let second = opt.optimize(&first.prompt, 20);
        assert_eq!(second.prompt, first.prompt);
        assert!(!second.prompt_truncated);
    }

    #[test]
    fn effective_tokens_never_exceed_budget() {
        let opt = optimizer();
        for len in [50usize, 123, 400, 4000] {
            let prompt = "x".repeat(len);
            let result = opt.optimize(&prompt, 20);
            assert!(result.effective_prompt_tokens <= 20);
        }
    }
}
