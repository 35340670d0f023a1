//! Task model tracked by the ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::recovery::RecoveryConfig;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Started,
    Progress,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Started,
        TaskStatus::Progress,
        TaskStatus::Retry,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Revoked,
    ];

    /// Success, Failure and Revoked never change once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// Running on a worker (or between engine-level retries).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Started | TaskStatus::Progress | TaskStatus::Retry
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Progress => "progress",
            TaskStatus::Retry => "retry",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Urgent,
    ];

    /// Engine priority, higher runs first
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 8,
            TaskPriority::Urgent => 10,
        }
    }
}

/// Why a failed task will not be remediated any further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResolution {
    Skipped,
    ManualInterventionRequired,
    /// Retry budget used up; needs a human
    Exhausted,
    /// Failure kind is on the stop list
    Fatal,
}

// ============================================================================
// Metadata
// ============================================================================

/// Position of a task inside a batch fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTag {
    pub batch_id: String,
    pub batch_index: usize,
    pub batch_total: usize,
}

/// Set on a successor created from a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    pub original_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub queue: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchTag>,
    /// Schedule that produced this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<ResumeMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

impl TaskMetadata {
    /// The task this one was derived from, via retry or resume.
    pub fn predecessor(&self) -> Option<&str> {
        self.retry_of.as_deref().or_else(|| {
            self.resumed_from
                .as_ref()
                .map(|marker| marker.original_task_id.as_str())
        })
    }
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub progress: Option<Value>,
    pub metadata: TaskMetadata,

    // Retry chain tracing
    pub root_task_id: String,
    pub resolution: Option<TaskResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        priority: TaskPriority,
        metadata: TaskMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            root_task_id: task_id.clone(),
            task_id,
            task_name: task_name.into(),
            status: TaskStatus::Pending,
            priority,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            progress: None,
            metadata,
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn with_root(mut self, root_task_id: impl Into<String>) -> Self {
        self.root_task_id = root_task_id.into();
        self
    }

    /// Move to `status`, returning whether anything changed.
    ///
    /// Terminal statuses are sticky. `started_at` is stamped on the first
    /// move into Started and `completed_at` on the first move into a
    /// terminal status; neither is ever overwritten.
    pub fn transition(&mut self, status: TaskStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }

        if status == TaskStatus::Started && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }

        self.status = status;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn queue(&self) -> &str {
        &self.metadata.queue
    }

    /// Seconds between submission and the worker picking the task up.
    pub fn wait_secs(&self) -> Option<f64> {
        self.started_at
            .map(|started| (started - self.created_at).num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds spent running, for completed tasks that were seen starting.
    pub fn runtime_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// A status change observed by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: String,
    pub task_name: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Task definitions
// ============================================================================

/// Registration for one task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub default_queue: Option<String>,
    pub required_kwargs: Vec<String>,
    pub recovery: Option<RecoveryConfig>,
    /// Resume rather than restart when checkpointed progress is between 20% and 50%
    pub prefers_resume: bool,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_queue: None,
            required_kwargs: Vec::new(),
            recovery: None,
            prefers_resume: true,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }

    pub fn require(mut self, kwarg: impl Into<String>) -> Self {
        self.required_kwargs.push(kwarg.into());
        self
    }

    pub fn recovery(mut self, config: RecoveryConfig) -> Self {
        self.recovery = Some(config);
        self
    }

    pub fn prefers_resume(mut self, prefers_resume: bool) -> Self {
        self.prefers_resume = prefers_resume;
        self
    }

    /// Names of required kwargs absent from `kwargs`.
    pub fn missing_kwargs(&self, kwargs: &Map<String, Value>) -> Vec<String> {
        self.required_kwargs
            .iter()
            .filter(|key| !kwargs.contains_key(key.as_str()))
            .cloned()
            .collect()
    }
}
