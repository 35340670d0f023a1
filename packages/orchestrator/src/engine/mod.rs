//! Execution engine boundary.
//!
//! Task handlers run on an external engine; the orchestrator only submits,
//! inspects and revokes. Implementations:
//! - [`MemoryEngine`] - scriptable, for tests and dry runs
//! - [`LocalEngine`] - runs registered async handlers in-process on tokio
//!
//! Failures crossing this boundary are already classified into
//! [`FailureKind`](crate::FailureKind); nothing downstream inspects error text.

mod local;
mod memory;

pub use local::{
    handler_fn, LocalEngine, LocalEngineConfig, ProgressReporter, TaskHandler, TaskInvocation,
};
pub use memory::MemoryEngine;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TaskError};
use crate::tasks::{TaskPriority, TaskStatus};

/// Engine-level automatic retry, applied before the orchestrator ever sees a failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineRetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

/// A submission handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: TaskPriority,
    pub queue: String,
    pub eta: Option<DateTime<Utc>>,
    pub countdown: Option<Duration>,
    pub expires: Option<DateTime<Utc>>,
    pub retry_policy: Option<EngineRetryPolicy>,
}

impl SubmitRequest {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: TaskPriority::Normal,
            queue: queue.into(),
            eta: None,
            countdown: None,
            expires: None,
            retry_policy: None,
        }
    }

    /// Earliest time the task may start. Countdown wins over eta.
    pub fn not_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.countdown {
            Some(countdown) => chrono::Duration::from_std(countdown)
                .ok()
                .map(|delta| now + delta),
            None => self.eta,
        }
    }
}

/// What the engine knows about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineTaskState {
    pub task_name: String,
    pub queue: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub received_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub progress: Option<Value>,
    pub worker: Option<String>,
    /// Periodic schedule that fired this task, if any
    pub origin: Option<String>,
}

/// One row of an inspect_* listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineTaskInfo {
    pub task_id: String,
    pub task_name: String,
    pub queue: String,
    pub priority: TaskPriority,
    pub worker: Option<String>,
    pub eta: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: String,
    pub online: bool,
    pub concurrency: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    /// Mean handler runtime in seconds
    pub avg_runtime_secs: Option<f64>,
}

impl WorkerStats {
    /// Fraction of worker slots in use.
    pub fn load(&self) -> f64 {
        if self.concurrency == 0 {
            0.0
        } else {
            self.active as f64 / self.concurrency as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicTrigger {
    Interval(Duration),
    /// Standard 5-field cron expression
    Cron(String),
}

/// Periodic registration: the engine submits `task_name` on every trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicSpec {
    pub name: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: String,
    pub priority: TaskPriority,
    pub trigger: PeriodicTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeOutcome {
    /// Task will not run (or was interrupted)
    Revoked,
    /// Task already started and `terminate` was not requested
    AlreadyRunning,
    /// Task already reached a terminal status
    AlreadyFinished,
    NotFound,
}

/// The external system that actually runs task handlers.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Enqueue a task, returning the engine-assigned id.
    async fn submit(&self, request: SubmitRequest) -> Result<String>;

    /// Current state, or `None` when the engine has no such task.
    async fn query(&self, task_id: &str) -> Result<Option<EngineTaskState>>;

    /// Tasks currently executing on a worker.
    async fn inspect_active(&self) -> Result<Vec<EngineTaskInfo>>;

    /// Tasks waiting on an eta/countdown.
    async fn inspect_scheduled(&self) -> Result<Vec<EngineTaskInfo>>;

    /// Tasks eligible to run but not yet picked up.
    async fn inspect_reserved(&self) -> Result<Vec<EngineTaskInfo>>;

    async fn worker_stats(&self) -> Result<Vec<WorkerStats>>;

    /// Ask the engine not to run the task. Only `terminate` interrupts a running one.
    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<RevokeOutcome>;

    /// Register (or replace) a periodic schedule.
    async fn register_periodic(&self, spec: PeriodicSpec) -> Result<()>;

    /// Returns false when nothing was registered under `name`.
    async fn unregister_periodic(&self, name: &str) -> Result<bool>;

    /// Number of submissions each periodic schedule has produced.
    async fn periodic_runs(&self) -> Result<HashMap<String, u64>>;

    /// Ids of tasks fired by periodic schedules since the previous call.
    async fn take_periodic_fired(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_takes_precedence_over_eta() {
        let now = Utc::now();
        let mut request = SubmitRequest::new("crawl_site", "default");
        request.eta = Some(now + chrono::Duration::hours(1));
        request.countdown = Some(Duration::from_secs(30));
        assert_eq!(request.not_before(now), Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn idle_worker_has_zero_load() {
        let stats = WorkerStats {
            worker: "w".into(),
            online: true,
            concurrency: 0,
            active: 0,
            processed: 0,
            failed: 0,
            avg_runtime_secs: None,
        };
        assert_eq!(stats.load(), 0.0);
    }
}
