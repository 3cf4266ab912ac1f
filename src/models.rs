//! Core data models for the conversational agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    PendingConfirmation,
    ReadyToExecute,
    Executed,
    Rejected,
}

impl ToolCallState {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolCallState::Executed | ToolCallState::Rejected)
    }
}

//
// ================= Message =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub created_at: DateTime<Utc>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Create a message with a fresh id
    pub fn new(role: MessageRole, parts: Vec<MessagePart>) -> Self {
        Self {
            id: generate_id(),
            role,
            parts,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![MessagePart::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![MessagePart::text(text)])
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultPart> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    /// Fold a resent copy into this stored message.
    ///
    /// Text and unsettled tool parts come from `incoming`. A tool call in a
    /// terminal state and a result carrying a real outcome are kept as
    /// stored, so a stale client copy can never re-arm a call that already
    /// ran or was rejected.
    pub fn merge_resent(&self, incoming: &Message) -> Message {
        let mut parts: Vec<MessagePart> = incoming
            .parts
            .iter()
            .map(|part| self.settled_part(part).unwrap_or_else(|| part.clone()))
            .collect();

        // settled parts the resent copy left out
        for stored in &self.parts {
            if !stored.is_settled() {
                continue;
            }
            let present = parts.iter().any(|part| same_tool_part(part, stored));
            if !present {
                parts.push(stored.clone());
            }
        }

        Message {
            id: self.id.clone(),
            role: self.role,
            parts,
            metadata: self.metadata.clone(),
        }
    }

    fn settled_part(&self, incoming: &MessagePart) -> Option<MessagePart> {
        self.parts
            .iter()
            .find(|stored| stored.is_settled() && same_tool_part(stored, incoming))
            .cloned()
    }
}

fn same_tool_part(a: &MessagePart, b: &MessagePart) -> bool {
    match (a, b) {
        (MessagePart::ToolCall(x), MessagePart::ToolCall(y)) => x.tool_call_id == y.tool_call_id,
        (MessagePart::ToolResult(x), MessagePart::ToolResult(y)) => {
            x.tool_call_id == y.tool_call_id
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    /// Terminal tool call, or a result that is no longer a decision marker
    pub fn is_settled(&self) -> bool {
        match self {
            MessagePart::Text { .. } => false,
            MessagePart::ToolCall(call) => call.state.is_terminal(),
            MessagePart::ToolResult(result) => !result.outcome.is_decision(),
        }
    }

    /// Tool call id referenced by this part, if any
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            MessagePart::Text { .. } => None,
            MessagePart::ToolCall(call) => Some(&call.tool_call_id),
            MessagePart::ToolResult(result) => Some(&result.tool_call_id),
        }
    }
}

//
// ================= Tool Parts =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    pub state: ToolCallState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPart {
    /// Back-reference to the call, not ownership
    pub tool_call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

/// Result of a tool call.
///
/// `Approved` and `Denied` are decision markers written by the calling UI
/// for calls that need human confirmation. The resolver replaces them with
/// `Success` or `Error` once the decision has been applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ToolOutcome {
    Approved,
    Denied,
    Success { value: Value },
    Error { message: String },
}

impl ToolOutcome {
    pub fn is_decision(&self) -> bool {
        matches!(self, ToolOutcome::Approved | ToolOutcome::Denied)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolOutcome::Error {
            message: message.into(),
        }
    }
}

//
// ================= Long-term Memory =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            created_at: Utc::now(),
        }
    }
}

//
// ================= Turn Completion =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    /// Model requested a tool that needs human confirmation
    AwaitingConfirmation,
    /// Step cap reached while the model kept calling tools
    StepLimit,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishMetadata {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub steps: usize,
}

/// Generate a message / tool call id
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::System => "System",
            MessageRole::Tool => "Tool",
        };
        write!(f, "{}", s)
    }
}
