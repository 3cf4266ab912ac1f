//! Tool-call execution and human-in-the-loop resolution
//!
//! The resolver applies decisions the user sent back for pending tool calls.
//! Approved calls run their executor; denied calls never do. Every failure
//! is isolated to its own call and reported as that call's outcome.

use crate::models::{
    Message, MessagePart, ToolCallPart, ToolCallState, ToolOutcome, ToolResultPart,
};
use crate::streaming::{StreamEvent, StreamWriter};
use crate::tools::{ToolInvocation, ToolRegistry};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome message for a call the user declined
pub const DENIED_MESSAGE: &str = "User denied access to tool execution";

/// Run one tool call through the registry.
///
/// Unknown tools, missing executors and executor errors all come back as an
/// error outcome rather than a Rust error.
pub async fn execute_tool_call(
    registry: &ToolRegistry,
    conversation_id: &str,
    call: &ToolCallPart,
) -> ToolOutcome {
    let Some(entry) = registry.get(&call.tool_name) else {
        warn!(tool_name = %call.tool_name, "Tool not registered");
        return ToolOutcome::error(format!("Tool not registered: {}", call.tool_name));
    };

    let Some(executor) = entry.executor.as_ref() else {
        warn!(tool_name = %call.tool_name, "Tool has no executor");
        return ToolOutcome::error(format!("No execute function for tool: {}", call.tool_name));
    };

    let invocation = ToolInvocation {
        conversation_id: conversation_id.to_string(),
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        arguments: call.arguments.clone(),
    };

    let start = Instant::now();
    let outcome = match executor.execute(&invocation).await {
        Ok(value) => ToolOutcome::Success { value },
        Err(e) => {
            warn!(tool_name = %call.tool_name, error = %e, "Tool execution failed");
            ToolOutcome::error(e.to_string())
        }
    };

    debug!(
        tool_name = %call.tool_name,
        tool_call_id = %call.tool_call_id,
        execution_time_ms = start.elapsed().as_millis() as u64,
        "Tool call finished"
    );

    outcome
}

/// Result of one resolution pass
#[derive(Debug)]
pub struct Resolution {
    pub messages: Vec<Message>,
    /// Ids of messages whose parts changed, in list order
    pub changed: Vec<String>,
    pub executed: usize,
    pub rejected: usize,
}

/// A pending call and the location of its decision marker
struct PendingCall {
    call_at: (usize, usize),
    result_at: (usize, usize),
    call: ToolCallPart,
    decision: ToolOutcome,
}

struct Decided {
    call_at: (usize, usize),
    result_at: (usize, usize),
    tool_call_id: String,
    state: ToolCallState,
    outcome: ToolOutcome,
}

/// Applies approve/deny decisions to tool calls
pub struct ToolCallResolver {
    registry: Arc<ToolRegistry>,
}

impl ToolCallResolver {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve every non-terminal call that has a decision marker.
    ///
    /// Calls held by the same message run one after another; different
    /// messages are resolved concurrently. Outcomes are written back and
    /// reported to the writer in original order.
    pub async fn resolve(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        writer: &StreamWriter,
    ) -> Resolution {
        let mut messages = messages;
        let pending = collect_pending(&messages);

        if pending.is_empty() {
            return Resolution {
                messages,
                changed: Vec::new(),
                executed: 0,
                rejected: 0,
            };
        }

        let mut by_message: BTreeMap<usize, Vec<PendingCall>> = BTreeMap::new();
        for call in pending {
            by_message.entry(call.call_at.0).or_default().push(call);
        }

        let groups = by_message.into_values().map(|calls| async move {
            let mut decided = Vec::with_capacity(calls.len());
            for pending in calls {
                decided.push(self.decide(conversation_id, pending).await);
            }
            decided
        });

        let decided: Vec<Decided> = join_all(groups).await.into_iter().flatten().collect();

        let mut changed: Vec<String> = Vec::new();
        let mut executed = 0;
        let mut rejected = 0;

        for item in decided {
            match item.state {
                ToolCallState::Rejected => rejected += 1,
                _ => executed += 1,
            }

            if let Some(MessagePart::ToolCall(call)) = messages
                .get_mut(item.call_at.0)
                .and_then(|m| m.parts.get_mut(item.call_at.1))
            {
                call.state = item.state;
            }

            if let Some(MessagePart::ToolResult(result)) = messages
                .get_mut(item.result_at.0)
                .and_then(|m| m.parts.get_mut(item.result_at.1))
            {
                result.outcome = item.outcome.clone();
            }

            for index in [item.call_at.0, item.result_at.0] {
                let id = &messages[index].id;
                if !changed.contains(id) {
                    changed.push(id.clone());
                }
            }

            writer
                .send(StreamEvent::ToolOutput {
                    tool_call_id: item.tool_call_id,
                    outcome: item.outcome,
                })
                .await;
        }

        info!(conversation_id, executed, rejected, "Tool calls resolved");

        Resolution {
            messages,
            changed,
            executed,
            rejected,
        }
    }

    async fn decide(&self, conversation_id: &str, pending: PendingCall) -> Decided {
        let PendingCall {
            call_at,
            result_at,
            call,
            decision,
        } = pending;

        let (state, outcome) = match decision {
            ToolOutcome::Denied => {
                debug!(tool_call_id = %call.tool_call_id, "Tool call denied");
                (ToolCallState::Rejected, ToolOutcome::error(DENIED_MESSAGE))
            }
            _ if self.registry.get(&call.tool_name).is_none() => {
                warn!(tool_name = %call.tool_name, "Decision for unknown tool");
                (
                    ToolCallState::Rejected,
                    ToolOutcome::error(format!("Tool not registered: {}", call.tool_name)),
                )
            }
            _ => {
                debug!(tool_call_id = %call.tool_call_id, "Tool call approved");
                let outcome = execute_tool_call(&self.registry, conversation_id, &call).await;
                (ToolCallState::Executed, outcome)
            }
        };

        Decided {
            call_at,
            result_at,
            tool_call_id: call.tool_call_id,
            state,
            outcome,
        }
    }
}

/// Pair each non-terminal call with the decision marker that follows it
fn collect_pending(messages: &[Message]) -> Vec<PendingCall> {
    let mut decisions: HashMap<&str, ((usize, usize), &ToolResultPart)> = HashMap::new();
    for (i, message) in messages.iter().enumerate() {
        for (j, part) in message.parts.iter().enumerate() {
            if let MessagePart::ToolResult(result) = part {
                if result.outcome.is_decision() {
                    decisions
                        .entry(result.tool_call_id.as_str())
                        .or_insert(((i, j), result));
                }
            }
        }
    }

    let mut pending = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        for (j, part) in message.parts.iter().enumerate() {
            let MessagePart::ToolCall(call) = part else {
                continue;
            };
            if call.state.is_terminal() {
                continue;
            }
            if let Some((result_at, result)) = decisions.get(call.tool_call_id.as_str()) {
                if *result_at > (i, j) {
                    pending.push(PendingCall {
                        call_at: (i, j),
                        result_at: *result_at,
                        call: call.clone(),
                        decision: result.outcome.clone(),
                    });
                }
            }
        }
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::models::MessageRole;
    use crate::tools::{ToolEntry, ToolExecutor, ToolSchema};
    use crate::Result;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTool {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for CountingTool {
        async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(format!("launched {}", invocation.arguments["target"])))
        }
    }

    struct BrokenTool;

    #[async_trait::async_trait]
    impl ToolExecutor for BrokenTool {
        async fn execute(&self, _invocation: &ToolInvocation) -> Result<Value> {
            Err(AgentError::ToolExecutionError("upstream timeout".into()))
        }
    }

    /// Sleeps for `delay_ms`, then records its call id as finished
    #[derive(Default)]
    struct SlowTool {
        finished: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for SlowTool {
        async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
            let delay = invocation.arguments["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.finished
                .lock()
                .unwrap()
                .push(invocation.tool_call_id.clone());
            Ok(json!(invocation.tool_call_id))
        }
    }

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: "test".to_string(),
            parameters: json!({"type": "object"}),
        }
    }

    fn call(id: &str, tool: &str) -> MessagePart {
        MessagePart::ToolCall(ToolCallPart {
            tool_call_id: id.to_string(),
            tool_name: tool.to_string(),
            arguments: json!({"target": "moon"}),
            state: ToolCallState::PendingConfirmation,
        })
    }

    fn marker(id: &str, tool: &str, decision: ToolOutcome) -> MessagePart {
        MessagePart::ToolResult(ToolResultPart {
            tool_call_id: id.to_string(),
            tool_name: tool.to_string(),
            outcome: decision,
        })
    }

    fn setup() -> (Arc<CountingTool>, ToolCallResolver) {
        let tool = Arc::new(CountingTool::default());
        let mut registry = ToolRegistry::new();
        registry.register(ToolEntry::confirmed(schema("launch"), Some(tool.clone())));
        registry.register(ToolEntry::confirmed(schema("broken"), Some(Arc::new(BrokenTool))));
        registry.register(ToolEntry::confirmed(schema("manual"), None));
        (tool, ToolCallResolver::new(Arc::new(registry)))
    }

    fn outcome_of(messages: &[Message], id: &str) -> ToolOutcome {
        messages
            .iter()
            .flat_map(|m| m.tool_results())
            .find(|r| r.tool_call_id == id)
            .map(|r| r.outcome.clone())
            .unwrap()
    }

    fn state_of(messages: &[Message], id: &str) -> ToolCallState {
        messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .find(|c| c.tool_call_id == id)
            .map(|c| c.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_call_never_executes() {
        let (tool, resolver) = setup();
        let messages = vec![
            Message::new(MessageRole::Assistant, vec![call("c1", "launch")]),
            Message::new(MessageRole::Tool, vec![marker("c1", "launch", ToolOutcome::Denied)]),
        ];

        let resolution = resolver
            .resolve("conv", messages, &StreamWriter::discard())
            .await;

        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolution.rejected, 1);
        assert_eq!(state_of(&resolution.messages, "c1"), ToolCallState::Rejected);
        assert_eq!(
            outcome_of(&resolution.messages, "c1"),
            ToolOutcome::error(DENIED_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_approved_call_executes_once() {
        let (tool, resolver) = setup();
        let messages = vec![
            Message::new(MessageRole::Assistant, vec![call("c1", "launch")]),
            Message::new(MessageRole::Tool, vec![marker("c1", "launch", ToolOutcome::Approved)]),
        ];
        let (writer, mut rx) = StreamWriter::channel(8);

        let resolution = resolver.resolve("conv", messages, &writer).await;

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolution.executed, 1);
        assert_eq!(resolution.changed.len(), 2);
        assert_eq!(
            outcome_of(&resolution.messages, "c1"),
            ToolOutcome::Success {
                value: json!("launched \"moon\"")
            }
        );

        match rx.recv().await.unwrap() {
            StreamEvent::ToolOutput { tool_call_id, .. } => assert_eq!(tool_call_id, "c1"),
            other => panic!("unexpected event: {other:?}"),
        }

        // a second pass finds nothing left to do
        let again = resolver
            .resolve("conv", resolution.messages, &StreamWriter::discard())
            .await;
        assert_eq!(again.executed, 0);
        assert!(again.changed.is_empty());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_call() {
        let (tool, resolver) = setup();
        let messages = vec![
            Message::new(
                MessageRole::Assistant,
                vec![call("c1", "broken"), call("c2", "manual"), call("c3", "launch")],
            ),
            Message::new(
                MessageRole::Tool,
                vec![
                    marker("c1", "broken", ToolOutcome::Approved),
                    marker("c2", "manual", ToolOutcome::Approved),
                    marker("c3", "launch", ToolOutcome::Approved),
                ],
            ),
        ];
        let (writer, mut rx) = StreamWriter::channel(8);

        let resolution = resolver.resolve("conv", messages, &writer).await;
        drop(writer);

        assert!(matches!(outcome_of(&resolution.messages, "c1"), ToolOutcome::Error { .. }));
        assert!(matches!(outcome_of(&resolution.messages, "c2"), ToolOutcome::Error { .. }));
        assert!(matches!(
            outcome_of(&resolution.messages, "c3"),
            ToolOutcome::Success { .. }
        ));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        let mut order = Vec::new();
        while let Some(StreamEvent::ToolOutput { tool_call_id, .. }) = rx.recv().await {
            order.push(tool_call_id);
        }
        assert_eq!(order, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_calls_across_messages_keep_original_order() {
        let slow = Arc::new(SlowTool::default());
        let mut registry = ToolRegistry::new();
        registry.register(ToolEntry::confirmed(schema("wait"), Some(slow.clone())));
        let resolver = ToolCallResolver::new(Arc::new(registry));

        let waiting = |id: &str, delay_ms: u64| {
            MessagePart::ToolCall(ToolCallPart {
                tool_call_id: id.to_string(),
                tool_name: "wait".to_string(),
                arguments: json!({"delay_ms": delay_ms}),
                state: ToolCallState::PendingConfirmation,
            })
        };
        let messages = vec![
            Message::new(MessageRole::Assistant, vec![waiting("a1", 80), waiting("a2", 20)]),
            Message::new(MessageRole::Assistant, vec![waiting("b1", 0)]),
            Message::new(
                MessageRole::Tool,
                vec![
                    marker("a1", "wait", ToolOutcome::Approved),
                    marker("a2", "wait", ToolOutcome::Approved),
                    marker("b1", "wait", ToolOutcome::Approved),
                ],
            ),
        ];
        let (writer, mut rx) = StreamWriter::channel(8);

        let resolution = resolver.resolve("conv", messages, &writer).await;
        drop(writer);

        // the second message does not wait behind the first; calls inside
        // one message run one after another
        assert_eq!(*slow.finished.lock().unwrap(), vec!["b1", "a1", "a2"]);

        assert_eq!(resolution.executed, 3);
        for id in ["a1", "a2", "b1"] {
            assert_eq!(state_of(&resolution.messages, id), ToolCallState::Executed);
            assert_eq!(
                outcome_of(&resolution.messages, id),
                ToolOutcome::Success { value: json!(id) }
            );
        }
        let results: Vec<&str> = resolution.messages[2]
            .tool_results()
            .map(|r| r.tool_call_id.as_str())
            .collect();
        assert_eq!(results, vec!["a1", "a2", "b1"]);

        let mut order = Vec::new();
        while let Some(StreamEvent::ToolOutput { tool_call_id, .. }) = rx.recv().await {
            order.push(tool_call_id);
        }
        assert_eq!(order, vec!["a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let (_, resolver) = setup();
        let messages = vec![
            Message::new(MessageRole::Assistant, vec![call("c1", "self_destruct")]),
            Message::new(
                MessageRole::Tool,
                vec![marker("c1", "self_destruct", ToolOutcome::Approved)],
            ),
        ];

        let resolution = resolver
            .resolve("conv", messages, &StreamWriter::discard())
            .await;
        assert_eq!(resolution.rejected, 1);
        assert!(matches!(
            outcome_of(&resolution.messages, "c1"),
            ToolOutcome::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_messages_without_decisions_untouched() {
        let (tool, resolver) = setup();
        let messages = vec![
            Message::user_text("hello"),
            Message::new(MessageRole::Assistant, vec![call("c1", "launch")]),
            Message::new(
                MessageRole::Tool,
                vec![marker(
                    "c1",
                    "launch",
                    ToolOutcome::Success {
                        value: json!("done"),
                    },
                )],
            ),
        ];

        let resolution = resolver
            .resolve("conv", messages.clone(), &StreamWriter::discard())
            .await;
        assert_eq!(resolution.messages, messages);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }
}
