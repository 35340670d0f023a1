use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::RecoveryStrategy;
use crate::error::FailureKind;
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Failure kind is on the stop list
    Fatal,
    /// Retry budget for the lineage is used up
    Exhausted,
}

/// Audit record of one remediation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt_id: Uuid,
    pub task_id: String,
    pub root_task_id: String,
    pub task_name: String,
    pub strategy: RecoveryStrategy,
    pub abort_reason: Option<AbortReason>,
    pub timestamp: DateTime<Utc>,
    pub error_message: String,
    pub failure_kind: FailureKind,
    /// Whether the remediation action itself went through, not the eventual task outcome
    pub success: bool,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub checkpoint_used: bool,
    pub checkpoint_id: Option<String>,
    pub successor_task_id: Option<String>,
    pub remediation_error: Option<String>,
}

impl RecoveryAttempt {
    pub(crate) fn new(task: &Task, error_message: &str, failure_kind: FailureKind) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            task_id: task.task_id.clone(),
            root_task_id: task.root_task_id.clone(),
            task_name: task.task_name.clone(),
            strategy: RecoveryStrategy::Abort,
            abort_reason: None,
            timestamp: Utc::now(),
            error_message: error_message.to_string(),
            failure_kind,
            success: false,
            next_retry_time: None,
            checkpoint_used: false,
            checkpoint_id: None,
            successor_task_id: None,
            remediation_error: None,
        }
    }

    pub(crate) fn abort(&mut self, reason: AbortReason) {
        self.strategy = RecoveryStrategy::Abort;
        self.abort_reason = Some(reason);
        self.success = false;
    }

    pub fn is_abort(&self) -> bool {
        self.strategy == RecoveryStrategy::Abort
    }
}

/// Result of `handle_failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub attempt: RecoveryAttempt,
    /// The failure was handled before; nothing new was done
    pub already_handled: bool,
}

impl RecoveryOutcome {
    pub fn strategy(&self) -> RecoveryStrategy {
        self.attempt.strategy
    }

    pub fn successor_task_id(&self) -> Option<&str> {
        self.attempt.successor_task_id.as_deref()
    }
}

/// Notified after every recorded attempt.
pub trait RecoveryObserver: Send + Sync {
    fn on_attempt(&self, attempt: &RecoveryAttempt);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_attempts: usize,
    pub by_strategy: HashMap<RecoveryStrategy, usize>,
    pub aborted_fatal: usize,
    pub aborted_exhausted: usize,
    /// Share of non-abort attempts whose remediation action went through
    pub remediation_success_rate: f64,
    pub successors_succeeded: usize,
    pub successors_failed: usize,
    pub successors_pending: usize,
    /// Share of finished successors that succeeded; `None` until one finishes
    pub effective_recovery_rate: Option<f64>,
}
