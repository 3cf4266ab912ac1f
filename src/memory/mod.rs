//! Agent Memory System
//!
//! Provides the conversation message log, long-term memory, context window
//! policy and rolling summarization of old messages into memory.

pub mod context_manager;
pub mod postgres;
pub mod store;
pub mod summarizer;

pub use context_manager::{ContextConfig, ContextManager};
pub use postgres::{PgBackend, PgMemoryStore, PgMessageStore};
pub use store::{InMemoryMemoryStore, InMemoryMessageStore, MemoryStore, MessageStore};
pub use summarizer::{CompactionOutcome, CompactionStop, ContextSummarizer};
