//! Context-window accounting for scraped sources.
//!
//! Sources are admitted in search order. When one pushes the running total past the ceiling it is
//! cut from the bottom to whatever budget is left and becomes the last one admitted. Earlier
//! sources are never touched again.

use std::sync::Arc;
use sopipe_core::{ContextItem, ContextItemId, ExtractedSource, Tokenizer};

/// Reserved for the instruction template and message framing.
pub const PROMPT_OVERHEAD_TOKENS: usize = 200;
pub const MAX_SOURCES: usize = 3;
pub const PROVIDER_TITLE: &str = "so";
pub const ITEM_DESCRIPTION: &str = "StackOverflow Answer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSource {
    pub url: String,
    pub blob: String,
    pub tokens: usize,
    pub truncated: bool,
}

/// Result of admitting one source.
#[derive(Debug, Clone)]
pub struct Admission {
    pub item: ContextItem,
    /// No further sources should be fetched.
    pub is_final: bool,
}

pub struct BudgetAccumulator {
    tokenizer: Arc<dyn Tokenizer>,
    ceiling: usize,
    total_tokens: usize,
    sources: Vec<AcceptedSource>,
    finished: bool,
}

impl BudgetAccumulator {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, query: &str, ceiling: usize) -> Self {
        let total_tokens = tokenizer
            .count_tokens(query)
            .saturating_add(PROMPT_OVERHEAD_TOKENS);
        Self {
            tokenizer,
            ceiling,
            total_tokens,
            sources: Vec::new(),
            finished: false,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn sources(&self) -> &[AcceptedSource] {
        &self.sources
    }

    pub fn into_blobs(self) -> Vec<String> {
        self.sources.into_iter().map(|s| s.blob).collect()
    }

    /// Admit one extracted source.
    ///
    /// Returns `None` once a previous admission was final; the source is not recorded.
    pub fn admit(&mut self, source: &ExtractedSource) -> Option<Admission> {
        if self.finished {
            tracing::debug!(url = %source.url, "source offered after final admission; ignored");
            return None;
        }

        let blob = source.to_blob();
        let new_tokens = self.tokenizer.count_tokens(&blob);
        let prior_tokens = self.total_tokens;
        self.total_tokens = prior_tokens.saturating_add(new_tokens);

        let mut accepted = AcceptedSource {
            url: source.url.clone(),
            blob,
            tokens: new_tokens,
            truncated: false,
        };
        let mut is_final = false;

        if self.total_tokens > self.ceiling {
            // Negative remaining budget floors at zero: the blob becomes empty.
            let remaining = self.ceiling.saturating_sub(prior_tokens);
            let pruned = self.tokenizer.prune_from_bottom(&accepted.blob, remaining);
            let pruned_tokens = self.tokenizer.count_tokens(&pruned);
            tracing::debug!(
                url = %accepted.url,
                before_tokens = new_tokens,
                after_tokens = pruned_tokens,
                ceiling = self.ceiling,
                "source truncated to fit context window"
            );
            accepted.blob = pruned;
            accepted.tokens = pruned_tokens;
            accepted.truncated = true;
            self.total_tokens = prior_tokens.saturating_add(pruned_tokens);
            is_final = true;
        }

        self.sources.push(accepted);
        if self.sources.len() >= MAX_SOURCES {
            is_final = true;
        }
        self.finished = is_final;

        let n = self.sources.len();
        let last = &self.sources[n - 1];
        Some(Admission {
            item: ContextItem {
                content: last.blob.clone(),
                description: ITEM_DESCRIPTION.to_string(),
                name: format!("StackOverflow {n}"),
                id: ContextItemId {
                    provider_title: PROVIDER_TITLE.to_string(),
                    item_id: last.url.clone(),
                },
            },
            is_final,
        })
    }
}
