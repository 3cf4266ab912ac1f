//! Tool registry
//!
//! Maps a tool name to its schema, execution policy and optional executor.
//! Tools that change the outside world can demand human confirmation before
//! their executor runs.

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod builtin;

pub use builtin::create_default_registry;

/// Schema sent to the model for a single tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPolicy {
    /// Executed as soon as the model requests it
    Automatic,
    /// Executed only after the user approves the call
    RequiresConfirmation,
}

/// A single request to run a tool
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub conversation_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Side-effecting half of a tool
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value>;
}

/// Capability descriptor for one registered tool
#[derive(Clone)]
pub struct ToolEntry {
    pub schema: ToolSchema,
    pub policy: ExecutionPolicy,
    pub executor: Option<Arc<dyn ToolExecutor>>,
}

impl ToolEntry {
    pub fn automatic(schema: ToolSchema, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            schema,
            policy: ExecutionPolicy::Automatic,
            executor: Some(executor),
        }
    }

    pub fn confirmed(schema: ToolSchema, executor: Option<Arc<dyn ToolExecutor>>) -> Self {
        Self {
            schema,
            policy: ExecutionPolicy::RequiresConfirmation,
            executor,
        }
    }

    pub fn requires_confirmation(&self) -> bool {
        self.policy == ExecutionPolicy::RequiresConfirmation
    }
}

/// Tool registry for looking up and executing tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, entry: ToolEntry) {
        self.tools.insert(entry.schema.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Schemas in name order, for the model request
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|entry| entry.schema.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
