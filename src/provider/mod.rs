//! Model provider trait and implementations
//!
//! The provider turns a system prompt, a converted message list and tool
//! schemas into either a complete response (summaries) or a stream of
//! chunks (chat turns).

use crate::error::AgentError;
use crate::models::{FinishReason, Message, MessagePart, MessageRole, ToolOutcome, Usage};
use crate::tools::ToolSchema;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ModelContent {
    Text(String),
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub content: Vec<ModelContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall(ModelToolCall),
    Finish { reason: FinishReason, usage: Usage },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ModelToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl ModelResponse {
    /// Fold streamed chunks into a single response
    pub fn from_chunks(chunks: impl IntoIterator<Item = ModelChunk>) -> Self {
        let mut response = ModelResponse {
            text: String::new(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        };

        for chunk in chunks {
            match chunk {
                ModelChunk::TextDelta(delta) => response.text.push_str(&delta),
                ModelChunk::ToolCall(call) => response.tool_calls.push(call),
                ModelChunk::Finish { reason, usage } => {
                    response.finish_reason = reason;
                    response.usage.add(&usage);
                }
            }
        }

        response
    }
}

pub type ChunkStream = BoxStream<'static, Result<ModelChunk>>;

/// Trait for hosted chat-completion models
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Non-streaming completion
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Streaming completion
    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream>;
}

/// Convert stored messages into provider input.
///
/// Tool calls become function calls on the model side; tool results become
/// function responses on the user side. A message mixing both is split so
/// each segment carries a single role.
pub fn convert_to_model_messages(messages: &[Message]) -> Vec<ModelMessage> {
    let mut converted: Vec<ModelMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        let text_role = match message.role {
            MessageRole::Assistant => ModelRole::Model,
            MessageRole::User | MessageRole::System | MessageRole::Tool => ModelRole::User,
        };

        let mut segments: Vec<ModelMessage> = Vec::new();

        for part in &message.parts {
            let (role, content) = match part {
                MessagePart::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    (text_role, ModelContent::Text(text.clone()))
                }
                MessagePart::ToolCall(call) => (
                    ModelRole::Model,
                    ModelContent::FunctionCall {
                        id: call.tool_call_id.clone(),
                        name: call.tool_name.clone(),
                        args: call.arguments.clone(),
                    },
                ),
                MessagePart::ToolResult(result) => (
                    ModelRole::User,
                    ModelContent::FunctionResponse {
                        id: result.tool_call_id.clone(),
                        name: result.tool_name.clone(),
                        response: outcome_payload(&result.outcome),
                    },
                ),
            };

            match segments.last_mut() {
                Some(last) if last.role == role => last.content.push(content),
                _ => segments.push(ModelMessage {
                    role,
                    content: vec![content],
                }),
            }
        }

        converted.extend(segments);
    }

    converted
}

/// Function-response payload for a tool outcome
pub fn outcome_payload(outcome: &ToolOutcome) -> Value {
    match outcome {
        ToolOutcome::Success { value } => json!({ "result": value }),
        ToolOutcome::Error { message } => json!({ "error": message }),
        ToolOutcome::Approved => json!({ "status": "approved, not yet executed" }),
        ToolOutcome::Denied => json!({ "error": "User denied access to tool execution" }),
    }
}

enum ScriptedReply {
    Chunks(Vec<ModelChunk>),
    /// The stream fails to start
    Failure(String),
    /// The stream yields some chunks, then a read error
    Broken(Vec<ModelChunk>, String),
}

/// Scripted provider for development & testing.
/// Replays canned replies in order and records every request.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a reply made of raw chunks
    pub fn with_chunks(self, chunks: Vec<ModelChunk>) -> Self {
        self.push(ScriptedReply::Chunks(chunks));
        self
    }

    /// Queue a plain text reply
    pub fn with_text(self, text: &str) -> Self {
        let chunks = if text.is_empty() {
            vec![finish(FinishReason::Stop)]
        } else {
            vec![ModelChunk::TextDelta(text.to_string()), finish(FinishReason::Stop)]
        };
        self.with_chunks(chunks)
    }

    /// Queue a reply that calls one tool
    pub fn with_tool_call(self, id: &str, name: &str, arguments: Value) -> Self {
        self.with_chunks(vec![
            ModelChunk::ToolCall(ModelToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }),
            finish(FinishReason::Stop),
        ])
    }

    /// Queue a provider failure
    pub fn with_failure(self, message: &str) -> Self {
        self.push(ScriptedReply::Failure(message.to_string()));
        self
    }

    /// Queue a reply that breaks off after `chunks`
    pub fn with_broken_stream(self, chunks: Vec<ModelChunk>, message: &str) -> Self {
        self.push(ScriptedReply::Broken(chunks, message.to_string()));
        self
    }

    fn push(&self, reply: ScriptedReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    fn next_reply(&self, request: &ModelRequest) -> Result<ScriptedReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let reply = self
            .replies
            .lock()
            .map_err(|_| AgentError::ProviderError("script lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| AgentError::ProviderError("script exhausted".to_string()))?;

        match reply {
            ScriptedReply::Failure(message) => Err(AgentError::ProviderError(message)),
            reply => Ok(reply),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(reason: FinishReason) -> ModelChunk {
    ModelChunk::Finish {
        reason,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        match self.next_reply(request)? {
            ScriptedReply::Chunks(chunks) => Ok(ModelResponse::from_chunks(chunks)),
            ScriptedReply::Broken(_, message) | ScriptedReply::Failure(message) => {
                Err(AgentError::ProviderError(message))
            }
        }
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream> {
        let items: Vec<Result<ModelChunk>> = match self.next_reply(request)? {
            ScriptedReply::Chunks(chunks) => chunks.into_iter().map(Ok).collect(),
            ScriptedReply::Broken(chunks, message) => chunks
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(AgentError::ProviderError(message))))
                .collect(),
            ScriptedReply::Failure(message) => return Err(AgentError::ProviderError(message)),
        };
        Ok(Box::pin(stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ToolCallPart, ToolCallState, ToolResultPart};
    use futures::StreamExt;

    #[test]
    fn test_convert_splits_calls_and_results() {
        let messages = vec![
            Message::user_text("weather in Rome?"),
            Message::new(
                MessageRole::Assistant,
                vec![
                    MessagePart::text("Checking."),
                    MessagePart::ToolCall(ToolCallPart {
                        tool_call_id: "c1".into(),
                        tool_name: "get_weather_information".into(),
                        arguments: json!({"city": "Rome"}),
                        state: ToolCallState::Executed,
                    }),
                    MessagePart::ToolResult(ToolResultPart {
                        tool_call_id: "c1".into(),
                        tool_name: "get_weather_information".into(),
                        outcome: ToolOutcome::Success { value: json!("sunny") },
                    }),
                    MessagePart::text("It is sunny."),
                ],
            ),
        ];

        let converted = convert_to_model_messages(&messages);
        let roles: Vec<ModelRole> = converted.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ModelRole::User, ModelRole::Model, ModelRole::User, ModelRole::Model]
        );
        assert_eq!(converted[1].content.len(), 2);
        assert_eq!(
            converted[2].content[0],
            ModelContent::FunctionResponse {
                id: "c1".into(),
                name: "get_weather_information".into(),
                response: json!({"result": "sunny"}),
            }
        );
    }

    #[test]
    fn test_denied_payload_is_an_error() {
        assert_eq!(
            outcome_payload(&ToolOutcome::Denied),
            json!({"error": "User denied access to tool execution"})
        );
    }

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new()
            .with_text("first")
            .with_failure("rate limited");
        let request = ModelRequest {
            system: String::new(),
            messages: vec![],
            tools: vec![],
        };

        let response = provider.generate(&request).await.unwrap();
        assert_eq!(response.text, "first");

        assert!(provider.stream(&request).await.is_err());
        assert!(provider.generate(&request).await.is_err());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_stream_yields_chunks() {
        let provider = ScriptedProvider::new().with_tool_call("c9", "get_local_time", json!({}));
        let request = ModelRequest {
            system: String::new(),
            messages: vec![],
            tools: vec![],
        };

        let chunks: Vec<ModelChunk> = provider
            .stream(&request)
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], ModelChunk::ToolCall(_)));
    }
}
