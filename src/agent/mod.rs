//! Chat agent - runs one conversation turn end to end
//!
//! INPUT → PERSIST → SUMMARIZE → SANITIZE → RESOLVE → PROMPT → STREAM → PERSIST

use crate::config::{build_stores, AgentConfig, Stores};
use crate::error::AgentError;
use crate::execution::ToolCallResolver;
use crate::memory::{ContextManager, ContextSummarizer, MemoryStore, MessageStore};
use crate::models::{FinishMetadata, MemoryEntry, Message, MessagePart, MessageRole};
use crate::provider::{GeminiClient, ModelProvider};
use crate::sanitizer::sanitize_messages;
use crate::scheduler::{ScheduledTask, Scheduler, TaskRunner};
use crate::streaming::{ResponseStreamer, StreamFailure, StreamWriter};
use crate::tools::{create_default_registry, ToolRegistry};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type TurnLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds a conversation's turn lock; the map entry is dropped with the
/// last holder.
struct TurnLease<'a> {
    locks: &'a TurnLocks,
    conversation_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // one reference in the map, one here
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
    }
}

/// What one turn did
#[derive(Debug)]
pub struct TurnOutcome {
    pub finish: FinishMetadata,
    /// Assistant and tool messages produced by the model
    pub produced: Vec<Message>,
    /// Batches folded into long-term memory before the model call
    pub summarized_batches: usize,
    pub executed_tools: usize,
    pub rejected_tools: usize,
}

/// Conversational agent with tools, confirmation and long-term memory
pub struct ChatAgent {
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    message_store: Arc<dyn MessageStore>,
    memory_store: Arc<dyn MemoryStore>,
    scheduler: Scheduler,
    context: ContextManager,
    summarizer: ContextSummarizer,
    resolver: ToolCallResolver,
    streamer: ResponseStreamer,
    turn_locks: TurnLocks,
}

impl ChatAgent {
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn ModelProvider>,
        registry: ToolRegistry,
        stores: Stores,
        scheduler: Scheduler,
    ) -> Self {
        let registry = Arc::new(registry);
        let context = ContextManager::with_config(config.context.clone());

        Self {
            summarizer: ContextSummarizer::new(provider.clone(), context.clone()),
            resolver: ToolCallResolver::new(registry.clone()),
            streamer: ResponseStreamer::new(provider, registry.clone())
                .with_max_steps(config.max_steps),
            context,
            registry,
            message_store: stores.messages,
            memory_store: stores.memories,
            scheduler,
            config,
            turn_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Gemini provider, built-in tools and configured storage
    pub fn from_config(config: AgentConfig, scheduler: Scheduler) -> Result<Self> {
        let provider = Arc::new(GeminiClient::new(
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
        )?);
        let registry = create_default_registry(scheduler.clone());
        let stores = build_stores(&config);

        Ok(Self::new(config, provider, registry, stores, scheduler))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Fails with a configuration error before any I/O when the model key is missing
    pub fn ensure_configured(&self) -> Result<()> {
        self.config.require_api_key().map(|_| ())
    }

    async fn acquire_turn(&self, conversation_id: &str) -> TurnLease<'_> {
        let lock = self
            .turn_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.clone().lock_owned().await;
        TurnLease {
            locks: &self.turn_locks,
            conversation_id: conversation_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_turn_locks(&self) -> usize {
        self.turn_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run one chat turn.
    ///
    /// Incoming messages are upserted by id, so a client resending the whole
    /// history (with decision markers filled in) is the normal case. Resent
    /// copies never roll back settled tool state, and messages already
    /// folded into long-term memory are not re-added.
    pub async fn on_chat_message(
        &self,
        conversation_id: &str,
        incoming: Vec<Message>,
        writer: &StreamWriter,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.ensure_configured()?;

        let _turn = self.acquire_turn(conversation_id).await;
        let start = Instant::now();

        info!(
            conversation_id,
            incoming = incoming.len(),
            "Chat turn started"
        );

        // === PERSIST INPUT ===
        if !incoming.is_empty() {
            self.message_store.append(conversation_id, &incoming).await?;
        }
        let mut live = self.message_store.list(conversation_id).await?;

        // === SUMMARIZE ===
        let mut summarized_batches = 0;
        if self.config.auto_summarize {
            let outcome = self
                .summarizer
                .compact(
                    conversation_id,
                    live,
                    self.message_store.as_ref(),
                    self.memory_store.as_ref(),
                    cancel,
                )
                .await;
            summarized_batches = outcome.batches;
            live = outcome.messages;
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // === SANITIZE + RESOLVE ===
        let sanitized = sanitize_messages(&live);
        debug!(
            conversation_id,
            live = live.len(),
            sanitized = sanitized.len(),
            "History sanitized"
        );

        let resolution = self
            .resolver
            .resolve(conversation_id, sanitized, writer)
            .await;

        if !resolution.changed.is_empty() {
            let changed: Vec<Message> = resolution
                .messages
                .iter()
                .filter(|m| resolution.changed.contains(&m.id))
                .cloned()
                .collect();
            self.message_store.append(conversation_id, &changed).await?;
        }

        // === PROMPT ===
        let memories = self.memory_store.list(conversation_id).await?;
        let system =
            self.context
                .build_system_prompt(&self.config.system_prompt, &memories, Utc::now());

        // === STREAM ===
        let streamed = self
            .streamer
            .stream(
                conversation_id,
                &system,
                &resolution.messages,
                writer,
                cancel,
                |finish| {
                    info!(
                        conversation_id,
                        input_tokens = finish.usage.input_tokens,
                        output_tokens = finish.usage.output_tokens,
                        "Model usage"
                    );
                },
            )
            .await;

        let output = match streamed {
            Ok(output) => output,
            Err(StreamFailure { error, partial }) => {
                // Executed tools and text the client already saw stay on record.
                if !partial.is_empty() {
                    if let Err(e) = self.message_store.append(conversation_id, &partial).await {
                        error!(conversation_id, error = %e, "Failed to persist partial turn");
                    }
                }
                return Err(error);
            }
        };

        if !output.messages.is_empty() {
            self.message_store
                .append(conversation_id, &output.messages)
                .await?;
        }

        info!(
            conversation_id,
            finish_reason = ?output.finish.finish_reason,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat turn complete"
        );

        Ok(TurnOutcome {
            finish: output.finish,
            produced: output.messages,
            summarized_batches,
            executed_tools: resolution.executed,
            rejected_tools: resolution.rejected,
        })
    }

    /// Record that a scheduled task ran
    pub async fn execute_task(&self, conversation_id: &str, description: &str) -> Result<Message> {
        let _turn = self.acquire_turn(conversation_id).await;

        let message = Message::new(
            MessageRole::User,
            vec![MessagePart::text(format!(
                "Running scheduled task: {}",
                description
            ))],
        );
        self.message_store
            .append(conversation_id, std::slice::from_ref(&message))
            .await?;

        info!(conversation_id, description, "Scheduled task recorded");
        Ok(message)
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.message_store.list(conversation_id).await
    }

    pub async fn memories(&self, conversation_id: &str) -> Result<Vec<MemoryEntry>> {
        self.memory_store.list(conversation_id).await
    }

    pub async fn scheduled_tasks(&self, conversation_id: &str) -> Vec<ScheduledTask> {
        self.scheduler.list(conversation_id).await
    }
}

#[async_trait::async_trait]
impl TaskRunner for ChatAgent {
    async fn run_task(&self, task: &ScheduledTask) -> Result<()> {
        self.execute_task(&task.conversation_id, &task.description)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::DENIED_MESSAGE;
    use crate::memory::{InMemoryMemoryStore, InMemoryMessageStore};
    use crate::models::{FinishReason, ToolCallState, ToolOutcome, ToolResultPart};
    use crate::provider::ScriptedProvider;
    use crate::tools::{ToolEntry, ToolExecutor, ToolInvocation, ToolSchema};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONV: &str = "conv-1";

    #[derive(Default)]
    struct CountingWeather {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for CountingWeather {
        async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(format!(
                "The weather in {} is sunny",
                invocation.arguments["city"].as_str().unwrap_or("?")
            )))
        }
    }

    fn configured() -> AgentConfig {
        AgentConfig {
            api_key: Some("test-key".to_string()),
            ..AgentConfig::default()
        }
    }

    fn memory_stores() -> Stores {
        Stores {
            messages: Arc::new(InMemoryMessageStore::new()),
            memories: Arc::new(InMemoryMemoryStore::new()),
        }
    }

    fn agent_with(
        config: AgentConfig,
        provider: Arc<ScriptedProvider>,
        weather: Arc<CountingWeather>,
    ) -> ChatAgent {
        let (scheduler, _rx) = Scheduler::new();
        let mut registry = ToolRegistry::new();
        registry.register(ToolEntry::confirmed(
            ToolSchema {
                name: "get_weather_information".to_string(),
                description: "weather".to_string(),
                parameters: json!({"type": "object"}),
            },
            Some(weather),
        ));
        ChatAgent::new(config, provider, registry, memory_stores(), scheduler)
    }

    fn decision(call_id: &str, outcome: ToolOutcome) -> Message {
        Message::new(
            MessageRole::Tool,
            vec![MessagePart::ToolResult(ToolResultPart {
                tool_call_id: call_id.to_string(),
                tool_name: "get_weather_information".to_string(),
                outcome,
            })],
        )
    }

    async fn run(agent: &ChatAgent, incoming: Vec<Message>) -> Result<TurnOutcome> {
        agent
            .on_chat_message(CONV, incoming, &StreamWriter::discard(), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_any_io() {
        let provider = Arc::new(ScriptedProvider::new().with_text("unused"));
        let agent = agent_with(
            AgentConfig::default(),
            provider.clone(),
            Arc::new(CountingWeather::default()),
        );

        let result = run(&agent, vec![Message::user_text("hi")]).await;

        assert!(matches!(result, Err(AgentError::ConfigurationError(_))));
        assert_eq!(provider.call_count(), 0);
        assert!(agent.messages(CONV).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plain_turn_persists_reply() {
        let provider = Arc::new(ScriptedProvider::new().with_text("Hello there."));
        let agent = agent_with(configured(), provider.clone(), Arc::new(CountingWeather::default()));

        let outcome = run(&agent, vec![Message::user_text("hi")]).await.unwrap();

        assert_eq!(outcome.finish.finish_reason, FinishReason::Stop);
        let stored = agent.messages(CONV).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].text(), "Hello there.");

        let request = &provider.requests()[0];
        assert!(request.system.contains("schedule_task"));
    }

    #[tokio::test]
    async fn test_approved_call_runs_on_next_turn() {
        let weather = Arc::new(CountingWeather::default());
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_tool_call("call-1", "get_weather_information", json!({"city": "Paris"}))
                .with_text("It is sunny in Paris."),
        );
        let agent = agent_with(configured(), provider, weather.clone());

        let first = run(&agent, vec![Message::user_text("weather in Paris?")])
            .await
            .unwrap();
        assert_eq!(first.finish.finish_reason, FinishReason::AwaitingConfirmation);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 0);

        let second = run(&agent, vec![decision("call-1", ToolOutcome::Approved)])
            .await
            .unwrap();
        assert_eq!(second.executed_tools, 1);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 1);

        let stored = agent.messages(CONV).await.unwrap();
        let call = stored.iter().flat_map(|m| m.tool_calls()).next().unwrap();
        assert_eq!(call.state, ToolCallState::Executed);
        let result = stored.iter().flat_map(|m| m.tool_results()).next().unwrap();
        assert_eq!(
            result.outcome,
            ToolOutcome::Success {
                value: json!("The weather in Paris is sunny")
            }
        );
        assert_eq!(stored.last().unwrap().text(), "It is sunny in Paris.");
    }

    #[tokio::test]
    async fn test_denied_call_never_executes() {
        let weather = Arc::new(CountingWeather::default());
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_tool_call("call-1", "get_weather_information", json!({"city": "Oslo"}))
                .with_text("Understood, I will not check."),
        );
        let agent = agent_with(configured(), provider, weather.clone());

        run(&agent, vec![Message::user_text("weather in Oslo?")])
            .await
            .unwrap();
        let second = run(&agent, vec![decision("call-1", ToolOutcome::Denied)])
            .await
            .unwrap();

        assert_eq!(second.rejected_tools, 1);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 0);

        let stored = agent.messages(CONV).await.unwrap();
        let result = stored.iter().flat_map(|m| m.tool_results()).next().unwrap();
        assert_eq!(result.outcome, ToolOutcome::error(DENIED_MESSAGE));
    }

    #[tokio::test]
    async fn test_long_history_is_summarized_before_reply() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_text("The user asked eleven questions.")
                .with_text("Answer."),
        );
        let agent = agent_with(configured(), provider.clone(), Arc::new(CountingWeather::default()));

        let history: Vec<Message> = (0..12)
            .map(|i| Message::user_text(format!("question {}", i)))
            .collect();
        let outcome = run(&agent, history).await.unwrap();

        assert_eq!(outcome.summarized_batches, 1);
        let memories = agent.memories(CONV).await.unwrap();
        assert_eq!(memories.len(), 1);

        // 12 - 4 summarized + 1 reply
        assert_eq!(agent.messages(CONV).await.unwrap().len(), 9);

        let reply_request = &provider.requests()[1];
        assert!(reply_request
            .system
            .contains("[Archived Conversation]: The user asked eleven questions."));
    }

    #[tokio::test]
    async fn test_dangling_calls_are_not_sent_to_the_model() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_tool_call("call-1", "get_weather_information", json!({"city": "Rome"}))
                .with_text("Sure, what else?"),
        );
        let agent = agent_with(configured(), provider.clone(), Arc::new(CountingWeather::default()));

        run(&agent, vec![Message::user_text("weather in Rome?")])
            .await
            .unwrap();
        // user moves on without deciding
        run(&agent, vec![Message::user_text("never mind")])
            .await
            .unwrap();

        let request = &provider.requests()[1];
        let has_call = request.messages.iter().any(|m| {
            m.content
                .iter()
                .any(|c| matches!(c, crate::provider::ModelContent::FunctionCall { .. }))
        });
        assert!(!has_call);
    }

    #[tokio::test]
    async fn test_resent_history_does_not_rerun_approved_call() {
        let weather = Arc::new(CountingWeather::default());
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_tool_call("call-1", "get_weather_information", json!({"city": "Lima"}))
                .with_text("It is sunny in Lima.")
                .with_text("You're welcome."),
        );
        let agent = agent_with(configured(), provider, weather.clone());

        run(&agent, vec![Message::user_text("weather in Lima?")])
            .await
            .unwrap();

        // client copy: user message plus the pending assistant call
        let mut client_history = agent.messages(CONV).await.unwrap();
        client_history.push(decision("call-1", ToolOutcome::Approved));

        run(&agent, client_history.clone()).await.unwrap();
        assert_eq!(weather.calls.load(Ordering::SeqCst), 1);

        // the client never refreshed and resends its stale copies
        client_history.push(Message::user_text("thanks"));
        let third = run(&agent, client_history).await.unwrap();

        assert_eq!(third.executed_tools, 0);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 1);

        let stored = agent.messages(CONV).await.unwrap();
        let call = stored.iter().flat_map(|m| m.tool_calls()).next().unwrap();
        assert_eq!(call.state, ToolCallState::Executed);
        let result = stored.iter().flat_map(|m| m.tool_results()).next().unwrap();
        assert!(!result.outcome.is_decision());
    }

    #[tokio::test]
    async fn test_resent_history_does_not_restore_summarized_messages() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_text("Twelve questions so far.")
                .with_text("Answer.")
                .with_text("Second answer."),
        );
        let agent = agent_with(configured(), provider, Arc::new(CountingWeather::default()));

        let mut history: Vec<Message> = (0..12)
            .map(|i| Message::user_text(format!("q{}", i)))
            .collect();
        run(&agent, history.clone()).await.unwrap();

        history.push(Message::user_text("q12"));
        let second = run(&agent, history).await.unwrap();
        assert_eq!(second.summarized_batches, 0);

        let texts: Vec<String> = agent
            .messages(CONV)
            .await
            .unwrap()
            .iter()
            .map(Message::text)
            .collect();
        let mut expected: Vec<String> = (4..12).map(|i| format!("q{}", i)).collect();
        expected.push("Answer.".to_string());
        expected.push("q12".to_string());
        expected.push("Second answer.".to_string());
        assert_eq!(texts, expected);
        assert_eq!(agent.memories(CONV).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_stream_keeps_executed_tool_steps() {
        let (scheduler, _rx) = Scheduler::new();
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_tool_call(
                    "call-1",
                    "schedule_task",
                    json!({
                        "description": "stretch",
                        "when": {"type": "delayed", "delayInSeconds": 600}
                    }),
                )
                .with_failure("connection reset"),
        );
        let agent = ChatAgent::new(
            configured(),
            provider,
            create_default_registry(scheduler.clone()),
            memory_stores(),
            scheduler,
        );

        let result = run(&agent, vec![Message::user_text("remind me to stretch")]).await;
        assert!(matches!(result, Err(AgentError::ProviderError(_))));

        let stored = agent.messages(CONV).await.unwrap();
        assert_eq!(stored.len(), 3);
        let call = stored.iter().flat_map(|m| m.tool_calls()).next().unwrap();
        assert_eq!(call.state, ToolCallState::Executed);
        assert!(stored.iter().flat_map(|m| m.tool_results()).any(|r| r.tool_call_id == "call-1"));
        assert_eq!(agent.scheduled_tasks(CONV).await.len(), 1);
    }

    #[tokio::test]
    async fn test_turn_locks_are_released() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_text("one")
                .with_text("two"),
        );
        let agent = agent_with(configured(), provider, Arc::new(CountingWeather::default()));

        run(&agent, vec![Message::user_text("hi")]).await.unwrap();
        agent
            .on_chat_message(
                "conv-2",
                vec![Message::user_text("hello")],
                &StreamWriter::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        agent.execute_task(CONV, "water the plants").await.unwrap();

        assert_eq!(agent.tracked_turn_locks(), 0);
    }

    #[tokio::test]
    async fn test_execute_task_records_message() {
        let agent = agent_with(
            configured(),
            Arc::new(ScriptedProvider::new()),
            Arc::new(CountingWeather::default()),
        );

        let message = agent.execute_task(CONV, "water the plants").await.unwrap();
        assert_eq!(message.role, MessageRole::User);

        let stored = agent.messages(CONV).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text(), "Running scheduled task: water the plants");
    }
}
