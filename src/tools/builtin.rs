//! Built-in tools
//!
//! Weather lookups need the user's confirmation; local time and the
//! scheduling tools run automatically.

use super::{ToolEntry, ToolExecutor, ToolInvocation, ToolRegistry, ToolSchema};
use crate::error::AgentError;
use crate::scheduler::{ScheduleWhen, Scheduler};
use crate::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

fn require_str<'a>(invocation: &'a ToolInvocation, field: &str) -> Result<&'a str> {
    invocation
        .arguments
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            AgentError::InvalidToolInput(format!(
                "{}: expected string field '{}'",
                invocation.tool_name, field
            ))
        })
}

pub struct WeatherTool;

impl WeatherTool {
    pub fn schema() -> ToolSchema {
        ToolSchema {
            name: "get_weather_information".to_string(),
            description: "Show the weather in a given city to the user".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string", "description": "City name"}
                },
                "required": ["city"]
            }),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for WeatherTool {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
        let city = require_str(invocation, "city")?;
        info!(city, "Weather lookup approved");
        Ok(json!(format!("The weather in {} is sunny", city)))
    }
}

pub struct LocalTimeTool;

impl LocalTimeTool {
    pub fn schema() -> ToolSchema {
        ToolSchema {
            name: "get_local_time".to_string(),
            description: "Get the local time for a specified location".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "Location name"}
                },
                "required": ["location"]
            }),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for LocalTimeTool {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
        let location = require_str(invocation, "location")?;
        Ok(json!({
            "location": location,
            "utc": Utc::now().to_rfc3339(),
        }))
    }
}

pub struct ScheduleTaskTool {
    scheduler: Scheduler,
}

impl ScheduleTaskTool {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema {
            name: "schedule_task".to_string(),
            description: "A tool to schedule a task to be executed at a later time".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "when": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["scheduled", "delayed", "no-schedule"]},
                            "date": {"type": "string", "description": "ISO 8601 date for type=scheduled"},
                            "delayInSeconds": {"type": "integer", "description": "Delay for type=delayed"}
                        },
                        "required": ["type"]
                    }
                },
                "required": ["description", "when"]
            }),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ScheduleTaskTool {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
        let description = require_str(invocation, "description")?;
        let when: ScheduleWhen = invocation
            .arguments
            .get("when")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AgentError::InvalidToolInput(format!("Invalid 'when': {}", e)))?
            .ok_or_else(|| AgentError::InvalidToolInput("Missing 'when'".to_string()))?;

        let task = self
            .scheduler
            .schedule(&invocation.conversation_id, when, description)
            .await?;

        Ok(json!({
            "scheduled": true,
            "taskId": task.id,
            "runAt": task.run_at.to_rfc3339(),
            "description": task.description,
        }))
    }
}

pub struct ListScheduledTasksTool {
    scheduler: Scheduler,
}

impl ListScheduledTasksTool {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema {
            name: "get_scheduled_tasks".to_string(),
            description: "List all tasks that have been scheduled".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ListScheduledTasksTool {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
        let tasks = self.scheduler.list(&invocation.conversation_id).await;
        Ok(serde_json::to_value(tasks)?)
    }
}

pub struct CancelScheduledTaskTool {
    scheduler: Scheduler,
}

impl CancelScheduledTaskTool {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema {
            name: "cancel_scheduled_task".to_string(),
            description: "Cancel a scheduled task using its ID".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "taskId": {"type": "string", "description": "ID of the task to cancel"}
                },
                "required": ["taskId"]
            }),
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for CancelScheduledTaskTool {
    async fn execute(&self, invocation: &ToolInvocation) -> Result<Value> {
        let task_id = require_str(invocation, "taskId")?;

        // Only tasks owned by this conversation may be cancelled.
        let owned = self
            .scheduler
            .list(&invocation.conversation_id)
            .await
            .iter()
            .any(|task| task.id == task_id);

        if !owned || !self.scheduler.cancel(task_id).await {
            return Err(AgentError::ToolExecutionError(format!(
                "No pending task with id {}",
                task_id
            )));
        }

        Ok(json!({ "cancelled": true, "taskId": task_id }))
    }
}

/// Create the default registry with the built-in tools.
pub fn create_default_registry(scheduler: Scheduler) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(ToolEntry::confirmed(
        WeatherTool::schema(),
        Some(Arc::new(WeatherTool)),
    ));
    registry.register(ToolEntry::automatic(
        LocalTimeTool::schema(),
        Arc::new(LocalTimeTool),
    ));
    registry.register(ToolEntry::automatic(
        ScheduleTaskTool::schema(),
        Arc::new(ScheduleTaskTool::new(scheduler.clone())),
    ));
    registry.register(ToolEntry::automatic(
        ListScheduledTasksTool::schema(),
        Arc::new(ListScheduledTasksTool::new(scheduler.clone())),
    ));
    registry.register(ToolEntry::automatic(
        CancelScheduledTaskTool::schema(),
        Arc::new(CancelScheduledTaskTool::new(scheduler)),
    ));

    registry
}
