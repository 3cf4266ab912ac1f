//! Scheduled follow-up tasks
//!
//! Tasks are kept in memory and fired by tokio timers. A fired task is
//! handed to the task runner through a channel, which records it in the
//! conversation as a synthetic user message.

use crate::error::AgentError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum delay: 30 days in seconds.
pub const MAX_DELAY_SECONDS: u64 = 30 * 24 * 60 * 60;

/// When a task should run, as requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScheduleWhen {
    Scheduled {
        date: DateTime<Utc>,
    },
    Delayed {
        #[serde(rename = "delayInSeconds")]
        delay_in_seconds: u64,
    },
    NoSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub conversation_id: String,
    pub description: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Receives tasks once their timer fires
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &ScheduledTask) -> Result<()>;
}

struct TaskSlot {
    task: ScheduledTask,
    timer: JoinHandle<()>,
}

/// In-memory task scheduler
#[derive(Clone)]
pub struct Scheduler {
    tasks: Arc<RwLock<HashMap<String, TaskSlot>>>,
    due_tx: mpsc::UnboundedSender<ScheduledTask>,
}

impl Scheduler {
    /// Create a scheduler and the receiving end for due tasks
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledTask>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            due_tx,
        };
        (scheduler, due_rx)
    }

    /// Schedule a task for a conversation
    pub async fn schedule(
        &self,
        conversation_id: &str,
        when: ScheduleWhen,
        description: &str,
    ) -> Result<ScheduledTask> {
        let now = Utc::now();

        let run_at = match when {
            ScheduleWhen::Scheduled { date } => {
                if date <= now {
                    return Err(AgentError::ScheduleError(format!(
                        "Scheduled date {} is in the past",
                        date.to_rfc3339()
                    )));
                }
                date
            }
            ScheduleWhen::Delayed { delay_in_seconds } => {
                if delay_in_seconds == 0 || delay_in_seconds > MAX_DELAY_SECONDS {
                    return Err(AgentError::ScheduleError(format!(
                        "Delay must be between 1 and {} seconds",
                        MAX_DELAY_SECONDS
                    )));
                }
                now + chrono::Duration::seconds(delay_in_seconds as i64)
            }
            ScheduleWhen::NoSchedule => {
                return Err(AgentError::InvalidToolInput(
                    "Task has no schedule; nothing to do".to_string(),
                ));
            }
        };

        if description.trim().is_empty() {
            return Err(AgentError::InvalidToolInput(
                "Task description must not be empty".to_string(),
            ));
        }

        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            description: description.to_string(),
            run_at,
            created_at: now,
        };

        let delay = (run_at - now).to_std().unwrap_or_default();
        self.insert(task.clone(), delay).await;

        info!(
            task_id = %task.id,
            conversation_id = %task.conversation_id,
            run_at = %task.run_at.to_rfc3339(),
            "Task scheduled"
        );

        Ok(task)
    }

    /// Register a task and arm its timer.
    ///
    /// The write lock is held while the timer is spawned so a timer that
    /// fires immediately still finds its slot.
    async fn insert(&self, task: ScheduledTask, delay: Duration) {
        let mut tasks = self.tasks.write().await;

        let slots = Arc::clone(&self.tasks);
        let due_tx = self.due_tx.clone();
        let task_id = task.id.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let fired = slots.write().await.remove(&task_id);
            if let Some(slot) = fired {
                debug!(task_id = %task_id, "Task due");
                if due_tx.send(slot.task).is_err() {
                    warn!(task_id = %task_id, "Task runner gone, dropping due task");
                }
            }
        });

        tasks.insert(task.id.clone(), TaskSlot { task, timer });
    }

    /// Pending tasks for a conversation, soonest first
    pub async fn list(&self, conversation_id: &str) -> Vec<ScheduledTask> {
        let tasks = self.tasks.read().await;

        let mut items: Vec<ScheduledTask> = tasks
            .values()
            .filter(|slot| slot.task.conversation_id == conversation_id)
            .map(|slot| slot.task.clone())
            .collect();

        items.sort_by_key(|task| task.run_at);
        items
    }

    /// Cancel a pending task. Returns false if it does not exist or already fired.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let removed = self.tasks.write().await.remove(task_id);

        match removed {
            Some(slot) => {
                slot.timer.abort();
                info!(task_id = %task_id, "Task cancelled");
                true
            }
            None => false,
        }
    }
}

/// Drive due tasks into the runner until the scheduler is dropped
pub async fn run_due_tasks(
    mut due_rx: mpsc::UnboundedReceiver<ScheduledTask>,
    runner: Arc<dyn TaskRunner>,
) {
    while let Some(task) = due_rx.recv().await {
        if let Err(e) = runner.run_task(&task).await {
            warn!(task_id = %task.id, error = %e, "Scheduled task failed");
        }
    }
}

/// Prompt fragment telling the model how to schedule tasks
pub fn schedule_prompt(now: DateTime<Utc>) -> String {
    format!(
        r#"[Schedule Parser Component]
Current time: {}

If the user asks to schedule a task, use the schedule_task tool with:
- when.type = "scheduled" and when.date (ISO 8601, UTC) for a specific date and time
- when.type = "delayed" and when.delayInSeconds for a relative delay
Use "no-schedule" only if the user gave no usable time. Use get_scheduled_tasks
to list pending tasks and cancel_scheduled_task to cancel one by id."#,
        now.to_rfc3339()
    )
}
