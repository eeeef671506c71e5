//! Token estimation used for context-window budgeting.

use sopipe_core::Tokenizer;

const CHARS_PER_TOKEN: usize = 4;

/// Character-based estimate: one token per 4 chars, rounded up.
///
/// Deterministic and model-agnostic; its own pruning is exact with respect to its own counting,
/// which is what the budget accumulator relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    fn prune_from_bottom(&self, text: &str, max_tokens: usize) -> String {
        let keep = max_tokens.saturating_mul(CHARS_PER_TOKEN);
        match text.char_indices().nth(keep) {
            Some((byte_idx, _)) => text[..byte_idx].to_string(),
            None => text.to_string(),
        }
    }
}
