use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubTaskStatus::Done | SubTaskStatus::Failed)
    }
}

/// One planner-produced unit of work inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub description: String,
    /// Tool names the planner expects this step to call. Advisory only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_hints: Vec<String>,
    pub status: SubTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(description: &str, tool_hints: Vec<String>) -> Self {
        Self {
            id: short_id(),
            description: description.to_string(),
            tool_hints,
            status: SubTaskStatus::Pending,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub time: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// The durable task record. Control signals live on [`TaskHandle`] and are
/// rebuilt fresh when a task is loaded from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub account: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub priority: u8,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubTask>,
    pub current_step: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_reminder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Creation-sortable task id: timestamp prefix plus an 8-char uuid tail.
pub fn generate_task_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), &uuid[..8])
}

/// 8-char id for sub-entities (sub-tasks, reminders).
pub fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

impl Task {
    pub fn new(account: &str, title: &str, description: &str, priority: u8) -> Self {
        Self {
            id: generate_task_id(),
            account: account.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            tags: Vec::new(),
            status: TaskStatus::Pending,
            priority,
            progress: 0.0,
            subtasks: Vec::new(),
            current_step: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            context: HashMap::new(),
            logs: Vec::new(),
            result: None,
            error: None,
            linked_reminder_id: None,
            parent_id: None,
        }
    }

    /// Apply a status transition with its timestamp bookkeeping.
    /// `canceled` is latched: once there, no further transition applies.
    pub fn apply_status(&mut self, status: TaskStatus) {
        if self.status == TaskStatus::Canceled {
            return;
        }
        self.status = status;
        match status {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Done => {
                self.finished_at = Some(Utc::now());
                self.progress = 100.0;
            }
            TaskStatus::Failed | TaskStatus::Canceled => {
                self.finished_at = Some(Utc::now());
            }
            TaskStatus::Pending | TaskStatus::Paused => {}
        }
    }

    pub fn add_log(&mut self, level: &str, message: &str) {
        self.logs.push(TaskLog {
            time: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
        });
    }
}

/// A live task: the record plus its non-persisted control signals.
///
/// Cancel is a latched token; pause is a level signal the executing worker
/// polls at sub-task boundaries.
pub struct TaskHandle {
    task: RwLock<Task>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Arc<Self> {
        let (pause, _) = watch::channel(false);
        Arc::new(Self {
            task: RwLock::new(task),
            cancel: CancellationToken::new(),
            pause,
        })
    }

    pub async fn snapshot(&self) -> Task {
        self.task.read().await.clone()
    }

    /// Mutate the record under the write lock and return the new snapshot.
    pub async fn update<F>(&self, mutate: F) -> Task
    where
        F: FnOnce(&mut Task),
    {
        let mut task = self.task.write().await;
        mutate(&mut task);
        task.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn trigger_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn request_pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn clear_pause(&self) {
        self.pause.send_replace(false);
    }

    pub fn pause_requested(&self) -> bool {
        *self.pause.borrow()
    }
}
