//! Streamed turn output
//!
//! [`StreamEvent`] is the wire vocabulary sent to the client; the
//! [`ResponseStreamer`] drives the model in streaming mode, runs automatic
//! tools between steps, and stops when the model is done, a tool needs the
//! user's confirmation, or the step cap is reached.

use crate::error::AgentError;
use crate::execution::execute_tool_call;
use crate::models::{
    generate_id, FinishMetadata, FinishReason, Message, MessagePart, MessageRole, ToolCallPart,
    ToolCallState, ToolOutcome, ToolResultPart, Usage,
};
use crate::provider::{convert_to_model_messages, ModelChunk, ModelProvider, ModelRequest};
use crate::tools::ToolRegistry;
use crate::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default cap on model steps per turn
pub const DEFAULT_MAX_STEPS: usize = 150;

// =====================================================
// Events
// =====================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },
    TextDelta { delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        requires_confirmation: bool,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutput {
        tool_call_id: String,
        outcome: ToolOutcome,
    },
    Finish(FinishMetadata),
    Error { message: String },
}

/// Sink for stream events. A closed receiver is ignored so a departed
/// client never fails the turn.
#[derive(Clone)]
pub struct StreamWriter {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl StreamWriter {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }

    /// Writer that drops every event, for background turns
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Returns false when nobody is listening
    pub async fn send(&self, event: StreamEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

// =====================================================
// Response streamer
// =====================================================

/// Messages produced by one streamed turn
#[derive(Debug)]
pub struct StreamOutput {
    pub messages: Vec<Message>,
    pub finish: FinishMetadata,
}

/// A turn that stopped early. `partial` holds what was produced before the
/// failure: completed steps, executed tool call/result pairs and any text
/// already streamed in the interrupted step.
#[derive(Debug)]
pub struct StreamFailure {
    pub error: AgentError,
    pub partial: Vec<Message>,
}

pub struct ResponseStreamer {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    max_steps: usize,
}

impl ResponseStreamer {
    pub fn new(provider: Arc<dyn ModelProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            registry,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Stream a reply to `history`.
    ///
    /// Text deltas reach the writer as they arrive. `on_finish` runs once,
    /// after the finish event, with the accumulated usage.
    pub async fn stream<F>(
        &self,
        conversation_id: &str,
        system: &str,
        history: &[Message],
        writer: &StreamWriter,
        cancel: &CancellationToken,
        on_finish: F,
    ) -> std::result::Result<StreamOutput, StreamFailure>
    where
        F: FnOnce(&FinishMetadata) + Send,
    {
        let mut produced: Vec<Message> = Vec::new();
        let mut usage = Usage::default();
        let mut steps = 0;

        let finish_reason = match self
            .run_steps(
                conversation_id,
                system,
                history,
                writer,
                cancel,
                &mut produced,
                &mut usage,
                &mut steps,
            )
            .await
        {
            Ok(reason) => reason,
            Err(error) => {
                info!(
                    conversation_id,
                    steps,
                    partial = produced.len(),
                    "Response stream stopped early"
                );
                return Err(StreamFailure {
                    error,
                    partial: produced,
                });
            }
        };

        let finish = FinishMetadata {
            finish_reason,
            usage,
            steps,
        };

        info!(
            conversation_id,
            steps,
            finish_reason = ?finish.finish_reason,
            produced = produced.len(),
            "Response streamed"
        );

        writer.send(StreamEvent::Finish(finish.clone())).await;
        on_finish(&finish);

        Ok(StreamOutput {
            messages: produced,
            finish,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        conversation_id: &str,
        system: &str,
        history: &[Message],
        writer: &StreamWriter,
        cancel: &CancellationToken,
        produced: &mut Vec<Message>,
        usage: &mut Usage,
        steps: &mut usize,
    ) -> Result<FinishReason> {
        let tools = self.registry.schemas();

        loop {
            if *steps >= self.max_steps {
                info!(conversation_id, steps = *steps, "Step limit reached");
                return Ok(FinishReason::StepLimit);
            }
            *steps += 1;

            let mut context = history.to_vec();
            context.extend(produced.iter().cloned());
            let request = ModelRequest {
                system: system.to_string(),
                messages: convert_to_model_messages(&context),
                tools: tools.clone(),
            };

            let mut chunks = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = self.provider.stream(&request) => result.map_err(|e| {
                    error!(conversation_id, error = %e, "Model stream failed to start");
                    e
                })?,
            };

            let message_id = generate_id();
            writer
                .send(StreamEvent::Start {
                    message_id: message_id.clone(),
                })
                .await;

            let mut text = String::new();
            let mut calls = Vec::new();
            let mut step_reason = FinishReason::Stop;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AgentError::Cancelled),
                    next = chunks.next() => next.transpose(),
                };

                match next {
                    Ok(None) => break,
                    Err(e) => {
                        if !matches!(e, AgentError::Cancelled) {
                            error!(conversation_id, error = %e, "Model stream failed");
                        }
                        // Text the client already saw stays in the history.
                        if !text.is_empty() {
                            let parts = vec![MessagePart::text(text)];
                            produced.push(assistant_message(message_id, parts));
                        }
                        return Err(e);
                    }
                    Ok(Some(ModelChunk::TextDelta(delta))) => {
                        text.push_str(&delta);
                        writer.send(StreamEvent::TextDelta { delta }).await;
                    }
                    Ok(Some(ModelChunk::ToolCall(call))) => calls.push(call),
                    Ok(Some(ModelChunk::Finish { reason, usage: step_usage })) => {
                        step_reason = reason;
                        usage.add(&step_usage);
                    }
                }
            }

            let mut parts = Vec::with_capacity(calls.len() + 1);
            if !text.is_empty() {
                parts.push(MessagePart::text(text));
            }

            if calls.is_empty() {
                if !parts.is_empty() {
                    produced.push(assistant_message(message_id, parts));
                }
                return Ok(step_reason);
            }

            let mut awaiting = false;
            let mut results = Vec::new();

            for call in calls {
                let requires_confirmation = self
                    .registry
                    .get(&call.name)
                    .map(|entry| entry.requires_confirmation())
                    .unwrap_or(false);

                writer
                    .send(StreamEvent::ToolCall {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        requires_confirmation,
                    })
                    .await;

                let mut part = ToolCallPart {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    arguments: call.arguments,
                    state: ToolCallState::ReadyToExecute,
                };

                if requires_confirmation {
                    debug!(tool = %part.tool_name, "Tool call awaiting confirmation");
                    part.state = ToolCallState::PendingConfirmation;
                    awaiting = true;
                } else {
                    let outcome = execute_tool_call(&self.registry, conversation_id, &part).await;
                    part.state = ToolCallState::Executed;
                    writer
                        .send(StreamEvent::ToolOutput {
                            tool_call_id: part.tool_call_id.clone(),
                            outcome: outcome.clone(),
                        })
                        .await;
                    results.push(MessagePart::ToolResult(ToolResultPart {
                        tool_call_id: part.tool_call_id.clone(),
                        tool_name: part.tool_name.clone(),
                        outcome,
                    }));
                }

                parts.push(MessagePart::ToolCall(part));
            }

            produced.push(assistant_message(message_id, parts));
            if !results.is_empty() {
                produced.push(Message::new(MessageRole::Tool, results));
            }

            if awaiting {
                return Ok(FinishReason::AwaitingConfirmation);
            }
        }
    }
}

fn assistant_message(id: String, parts: Vec<MessagePart>) -> Message {
    let mut message = Message::new(MessageRole::Assistant, parts);
    message.id = id;
    message
}
