//! Rolling context compaction
//!
//! While the live history is at or above `keep_recent + batch_size`, the
//! oldest batch is summarized by the model, the summary is appended to
//! long-term memory, and only then is the batch deleted from the message
//! store. Any failure stops the loop and leaves the remaining backlog for
//! the next turn.

use crate::memory::context_manager::{archive_text, ContextManager};
use crate::memory::store::{MemoryStore, MessageStore};
use crate::models::Message;
use crate::provider::{convert_to_model_messages, ModelProvider, ModelRequest};
use crate::sanitizer::sanitize_messages;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Instruction given to the model for each batch
pub const SUMMARY_INSTRUCTION: &str = "You are an expert summarizer. Summarize the following \
conversation segment concisely, preserving key facts, user preferences, and decisions. This \
summary will be stored in long-term memory to maintain context.";

/// Why a compaction round ended before the history dropped below the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStop {
    ProviderFailure,
    EmptySummary,
    PersistFailure,
    DeleteFailure,
    Cancelled,
}

/// Result of one compaction run
#[derive(Debug)]
pub struct CompactionOutcome {
    /// Live messages after compaction
    pub messages: Vec<Message>,
    /// Batches summarized, persisted and deleted
    pub batches: usize,
    /// Set when the loop ended early
    pub stopped: Option<CompactionStop>,
}

/// Summarizes old messages into long-term memory
pub struct ContextSummarizer {
    provider: Arc<dyn ModelProvider>,
    context: ContextManager,
}

impl ContextSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>, context: ContextManager) -> Self {
        Self { provider, context }
    }

    /// Drain the backlog batch by batch.
    ///
    /// The working list is threaded through each iteration and returned;
    /// completed batches stay deleted even if a later batch fails.
    pub async fn compact(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        message_store: &dyn MessageStore,
        memory_store: &dyn MemoryStore,
        cancel: &CancellationToken,
    ) -> CompactionOutcome {
        let mut live = messages;
        let mut batches = 0;
        let mut stopped = None;

        while let Some(batch) = self.context.next_batch(&live) {
            if cancel.is_cancelled() {
                stopped = Some(CompactionStop::Cancelled);
                break;
            }

            let batch_len = batch.len();
            let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
            let request = ModelRequest {
                system: SUMMARY_INSTRUCTION.to_string(),
                messages: convert_to_model_messages(&sanitize_messages(batch)),
                tools: Vec::new(),
            };

            info!(
                conversation_id,
                batch = batch_len,
                live = live.len(),
                "Summarizing oldest messages"
            );

            let generated = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = Some(CompactionStop::Cancelled);
                    break;
                }
                result = self.provider.generate(&request) => result,
            };

            let summary = match generated {
                Ok(response) if !response.text.trim().is_empty() => response.text,
                Ok(_) => {
                    warn!(conversation_id, "Summarizer returned empty text, keeping batch");
                    stopped = Some(CompactionStop::EmptySummary);
                    break;
                }
                Err(e) => {
                    warn!(conversation_id, error = %e, "Auto-summarization failed");
                    stopped = Some(CompactionStop::ProviderFailure);
                    break;
                }
            };

            // Persist before delete: a batch disappears only once its summary is stored.
            if let Err(e) = memory_store
                .append(conversation_id, &archive_text(&summary))
                .await
            {
                warn!(conversation_id, error = %e, "Failed to store summary, keeping batch");
                stopped = Some(CompactionStop::PersistFailure);
                break;
            }

            if let Err(e) = message_store.delete(conversation_id, &ids).await {
                error!(
                    conversation_id,
                    error = %e,
                    "Summary stored but batch delete failed; batch will be summarized again"
                );
                stopped = Some(CompactionStop::DeleteFailure);
                break;
            }

            live.drain(..batch_len);
            batches += 1;
        }

        if batches > 0 {
            info!(conversation_id, batches, live = live.len(), "Context compacted");
        }

        CompactionOutcome {
            messages: live,
            batches,
            stopped,
        }
    }
}
