//! Context Window Management
//!
//! Decides when the live history is long enough to compact, which messages
//! form the next batch, and how archived memories are folded back into the
//! system prompt.

use crate::models::{MemoryEntry, Message};
use crate::scheduler::schedule_prompt;
use chrono::{DateTime, Utc};

/// Prefix marking archived context in long-term memory
pub const ARCHIVE_PREFIX: &str = "[Archived Conversation]: ";

/// Configuration for rolling summarization
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Number of most recent messages never summarized
    pub keep_recent: usize,
    /// Number of oldest messages folded into one summary
    pub batch_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            keep_recent: 8,
            batch_size: 4,
        }
    }
}

/// Manages context window and prompt assembly
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Live count that triggers a summarization round
    pub fn threshold(&self) -> usize {
        self.config.keep_recent + self.config.batch_size
    }

    pub fn should_summarize(&self, live_count: usize) -> bool {
        self.config.batch_size > 0 && live_count >= self.threshold()
    }

    /// Oldest batch to summarize, or `None` below the threshold
    pub fn next_batch<'a>(&self, messages: &'a [Message]) -> Option<&'a [Message]> {
        if !self.should_summarize(messages.len()) {
            return None;
        }
        Some(&messages[..self.config.batch_size])
    }

    /// Build the system prompt: base prompt, scheduling instructions, then
    /// long-term memory oldest first.
    pub fn build_system_prompt(
        &self,
        base_prompt: &str,
        memories: &[MemoryEntry],
        now: DateTime<Utc>,
    ) -> String {
        let mut prompt = String::with_capacity(base_prompt.len() + 512);
        prompt.push_str(base_prompt.trim_end());
        prompt.push_str("\n\n");
        prompt.push_str(&schedule_prompt(now));

        if !memories.is_empty() {
            prompt.push_str("\n\n## Long-term Memory\n");
            prompt.push_str(
                "Entries marked as archived summarize earlier parts of this conversation.\n\n",
            );
            for entry in memories {
                prompt.push_str(&format!(
                    "- ({}) {}\n",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.text
                ));
            }
        }

        prompt
    }
}

/// Memory text for a generated summary
pub fn archive_text(summary: &str) -> String {
    format!("{}{}", ARCHIVE_PREFIX, summary.trim())
}
