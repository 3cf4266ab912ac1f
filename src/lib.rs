//! Conversational Agent
//!
//! A chat agent that:
//! - Streams model replies to the client as they are generated
//! - Runs tools, asking the user first for tools that need confirmation
//! - Folds old conversation history into long-term memory summaries
//! - Schedules follow-up tasks that are recorded back into the conversation
//!
//! TURN:
//! PERSIST → SUMMARIZE → SANITIZE → RESOLVE → STREAM → PERSIST

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod memory;
pub mod models;
pub mod provider;
pub mod sanitizer;
pub mod scheduler;
pub mod streaming;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::ChatAgent;
