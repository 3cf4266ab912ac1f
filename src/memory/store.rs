//! Conversation message store and long-term memory store
//!
//! Both are keyed by conversation id. The in-memory implementations are the
//! default; see [`crate::memory::postgres`] for the durable backend.

use crate::models::{MemoryEntry, Message};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered log of conversation messages
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Append messages in order.
    ///
    /// A message whose id is already stored is merged into the stored copy
    /// in place with [`Message::merge_resent`], keeping its position. Ids
    /// archived by [`MessageStore::delete`] are skipped.
    async fn append(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;

    /// Delete messages by id and archive the ids so they never come back.
    /// Returns how many were removed.
    async fn delete(&self, conversation_id: &str, ids: &[String]) -> Result<usize>;

    /// All messages in arrival order
    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// A slice of the log in arrival order
    async fn read(&self, conversation_id: &str, offset: usize, limit: usize) -> Result<Vec<Message>> {
        let messages = self.list(conversation_id).await?;
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }
}

/// Append-only long-term note store
#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append(&self, conversation_id: &str, text: &str) -> Result<MemoryEntry>;

    /// Entries oldest first
    async fn list(&self, conversation_id: &str) -> Result<Vec<MemoryEntry>>;
}

#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    archived: HashSet<String>,
}

/// In-memory message store for development
#[derive(Default)]
pub struct InMemoryMessageStore {
    conversations: Arc<RwLock<HashMap<String, ConversationLog>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let log = conversations
            .entry(conversation_id.to_string())
            .or_default();

        for message in messages {
            if log.archived.contains(&message.id) {
                continue;
            }
            match log.messages.iter_mut().find(|stored| stored.id == message.id) {
                Some(stored) => *stored = stored.merge_resent(message),
                None => log.messages.push(message.clone()),
            }
        }

        Ok(())
    }

    async fn delete(&self, conversation_id: &str, ids: &[String]) -> Result<usize> {
        let mut conversations = self.conversations.write().await;

        let Some(log) = conversations.get_mut(conversation_id) else {
            return Ok(0);
        };

        let before = log.messages.len();
        log.messages.retain(|message| !ids.contains(&message.id));
        log.archived.extend(ids.iter().cloned());
        Ok(before - log.messages.len())
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default())
    }
}

/// In-memory long-term memory for development
#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<MemoryEntry>>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn append(&self, conversation_id: &str, text: &str) -> Result<MemoryEntry> {
        let entry = MemoryEntry::new(text.to_string());

        let mut entries = self.entries.write().await;
        entries
            .entry(conversation_id.to_string())
            .or_insert_with(Vec::new)
            .push(entry.clone());

        Ok(entry)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(conversation_id).cloned().unwrap_or_default())
    }
}
