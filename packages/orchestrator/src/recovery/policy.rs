//! Applies a task type's recovery policy to a reported failure.
//!
//! ```text
//! handle_failure(task, kind)
//!        │
//!        ├─ kind ∈ stop_on ───────────────► Abort (fatal)
//!        ├─ lineage budget used ──────────► Abort (exhausted)
//!        └─ select_strategy
//!              ├─ Manual / Skip ──────────► resolution only
//!              ├─ Resume / Restart ───────► ResumeCoordinator
//!              └─ Retry ──────────────────► TaskLedger::create (backoff countdown)
//! ```
//!
//! Every decision is recorded as a [`RecoveryAttempt`], mirrored to the audit
//! sink and handed to observers. A failure is handled once per task id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use super::attempt::{
    AbortReason, RecoveryAttempt, RecoveryObserver, RecoveryOutcome, RecoveryStatistics,
};
use super::config::{RecoveryConfig, RecoveryStrategy};
use crate::audit::{AuditRecord, AuditSink};
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::monitor::{HealthLevel, StatusMonitor};
use crate::resume::{is_resumable, ResumeCoordinator, ResumeStrategy};
use crate::tasks::{CreateTask, Task, TaskLedger, TaskResolution, TaskStatus};

/// Strategy for a failure that is neither fatal nor over budget.
pub fn select_strategy(
    config: &RecoveryConfig,
    kind: FailureKind,
    has_checkpoint: bool,
) -> RecoveryStrategy {
    if config.strategy() == RecoveryStrategy::Manual {
        RecoveryStrategy::Manual
    } else if config.use_checkpoint() && has_checkpoint {
        RecoveryStrategy::Resume
    } else if config.retries_on(kind) {
        RecoveryStrategy::Retry
    } else {
        config.strategy()
    }
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

pub struct RecoveryPolicyEngine {
    ledger: Arc<TaskLedger>,
    coordinator: Arc<ResumeCoordinator>,
    audit: Arc<dyn AuditSink>,
    default_config: RecoveryConfig,
    health: Option<Arc<StatusMonitor>>,
    attempts: Mutex<Vec<RecoveryAttempt>>,
    observers: RwLock<Vec<Arc<dyn RecoveryObserver>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl RecoveryPolicyEngine {
    pub fn new(
        ledger: Arc<TaskLedger>,
        coordinator: Arc<ResumeCoordinator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            ledger,
            coordinator,
            audit,
            default_config: RecoveryConfig::default(),
            health: None,
            attempts: Mutex::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Policy for task types that do not define their own.
    pub fn with_default_config(mut self, config: RecoveryConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Defer retries while the latest health snapshot is critical.
    pub fn with_health(mut self, monitor: Arc<StatusMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    pub fn default_config(&self) -> &RecoveryConfig {
        &self.default_config
    }

    pub fn register_observer(&self, observer: Arc<dyn RecoveryObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn attempts_lock(&self) -> MutexGuard<'_, Vec<RecoveryAttempt>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config_for(&self, task_name: &str) -> RecoveryConfig {
        self.ledger
            .definition(task_name)
            .and_then(|definition| definition.recovery)
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn recorded(&self, task_id: &str) -> Option<RecoveryAttempt> {
        self.attempts_lock()
            .iter()
            .find(|attempt| attempt.task_id == task_id)
            .cloned()
    }

    fn reserve(&self, task_id: &str) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(task_id.to_string()) {
            return Err(OrchestratorError::RemediationInProgress {
                task_id: task_id.to_string(),
            });
        }
        Ok(InFlight {
            set: &self.in_flight,
            task_id: task_id.to_string(),
        })
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// Decide and carry out remediation for a failed task.
    ///
    /// Errors when the task cannot be found, has not failed, is already being
    /// handled or still has a live successor. A remediation that fails is
    /// recorded on the attempt instead.
    pub async fn handle_failure(
        &self,
        task_id: &str,
        error_message: &str,
        kind: FailureKind,
    ) -> Result<RecoveryOutcome> {
        if let Some(attempt) = self.recorded(task_id) {
            return Ok(RecoveryOutcome {
                attempt,
                already_handled: true,
            });
        }

        let _in_flight = self.reserve(task_id)?;
        if let Some(attempt) = self.recorded(task_id) {
            return Ok(RecoveryOutcome {
                attempt,
                already_handled: true,
            });
        }

        let task = self.ledger.status(task_id).await?;
        if !is_resumable(task.status) {
            return Err(OrchestratorError::NotResumable {
                task_id: task_id.to_string(),
                reason: format!("task is {}, not failed or revoked", task.status),
            });
        }
        if let Some(successor_task_id) = self.coordinator.live_successor_id(task_id).await {
            return Err(OrchestratorError::SuccessorLive {
                task_id: task_id.to_string(),
                successor_task_id,
            });
        }

        let config = self.config_for(&task.task_name);
        let mut attempt = RecoveryAttempt::new(&task, error_message, kind);

        let (remediations, prior_retries) = self.lineage_counts(&task.root_task_id);

        if config.stops_on(kind) {
            attempt.abort(AbortReason::Fatal);
            self.resolve(&mut attempt, TaskResolution::Fatal);
            warn!(
                task_id = %task_id,
                failure_kind = %kind,
                "Fatal failure, not recovering"
            );
        } else if remediations >= config.max_retries() as usize {
            attempt.abort(AbortReason::Exhausted);
            self.resolve(&mut attempt, TaskResolution::Exhausted);
            warn!(
                task_id = %task_id,
                root_task_id = %task.root_task_id,
                attempts = remediations,
                "Retry budget exhausted, manual intervention required"
            );
        } else {
            let has_checkpoint = config.use_checkpoint()
                && self.coordinator.find_checkpoint(task_id).await.is_some();
            attempt.strategy = select_strategy(&config, kind, has_checkpoint);
            self.execute(&task, &config, prior_retries, &mut attempt)
                .await;
        }

        self.record(attempt.clone()).await;
        Ok(RecoveryOutcome {
            attempt,
            already_handled: false,
        })
    }

    /// Remediations and retries already spent by the lineage rooted at `root`.
    fn lineage_counts(&self, root: &str) -> (usize, u32) {
        let attempts = self.attempts_lock();
        let lineage = attempts
            .iter()
            .filter(|attempt| attempt.root_task_id == root);
        let mut remediations = 0;
        let mut retries = 0u32;
        for attempt in lineage {
            if attempt.strategy.is_remediation() {
                remediations += 1;
            }
            if attempt.strategy == RecoveryStrategy::Retry {
                retries += 1;
            }
        }
        (remediations, retries)
    }

    async fn execute(
        &self,
        task: &Task,
        config: &RecoveryConfig,
        prior_retries: u32,
        attempt: &mut RecoveryAttempt,
    ) {
        match attempt.strategy {
            RecoveryStrategy::Retry => {
                let delay = self.retry_delay(config, prior_retries);
                match self.submit_retry(task, delay).await {
                    Ok(successor) => {
                        attempt.success = true;
                        attempt.successor_task_id = Some(successor);
                        attempt.next_retry_time = chrono::Duration::from_std(delay)
                            .ok()
                            .map(|delay| Utc::now() + delay);
                        info!(
                            task_id = %task.task_id,
                            successor_task_id = ?attempt.successor_task_id,
                            delay_secs = delay.as_secs_f64(),
                            "Retry scheduled"
                        );
                    }
                    Err(e) => self.remediation_failed(attempt, e),
                }
            }
            RecoveryStrategy::Resume | RecoveryStrategy::Restart => {
                let (strategy, force_restart) = match attempt.strategy {
                    RecoveryStrategy::Resume => (ResumeStrategy::ResumeFromCheckpoint, false),
                    _ => (ResumeStrategy::Restart, true),
                };
                match self
                    .coordinator
                    .resume(&task.task_id, None, strategy, force_restart)
                    .await
                {
                    Ok(result) => {
                        attempt.success = true;
                        attempt.checkpoint_used = result.checkpoint_id.is_some();
                        attempt.checkpoint_id = result.checkpoint_id;
                        attempt.successor_task_id = Some(result.successor_task_id);
                    }
                    Err(e) => self.remediation_failed(attempt, e),
                }
            }
            RecoveryStrategy::Skip => self.resolve(attempt, TaskResolution::Skipped),
            RecoveryStrategy::Manual => {
                self.resolve(attempt, TaskResolution::ManualInterventionRequired)
            }
            RecoveryStrategy::Abort => {}
        }
    }

    fn retry_delay(&self, config: &RecoveryConfig, prior_retries: u32) -> Duration {
        let critical = self
            .health
            .as_ref()
            .and_then(|monitor| monitor.latest())
            .is_some_and(|health| health.level == HealthLevel::Critical);
        if critical {
            config.max_retry_delay()
        } else {
            config.retry_delay_for(prior_retries)
        }
    }

    async fn submit_retry(&self, task: &Task, delay: Duration) -> Result<String> {
        let _slot = self.coordinator.claim_successor(&task.task_id).await?;
        let mut request = CreateTask::builder()
            .task_name(task.task_name.clone())
            .args(task.metadata.args.clone())
            .kwargs(Value::Object(task.metadata.kwargs.clone()))
            .priority(task.priority)
            .queue(task.metadata.queue.clone())
            .countdown(delay)
            .tags(task.metadata.tags.clone())
            .retry_of(task.task_id.clone())
            .root_task_id(task.root_task_id.clone())
            .build();
        request.batch = task.metadata.batch.clone();
        request.schedule = task.metadata.schedule.clone();
        self.ledger.create(request).await
    }

    /// Record a resolution; success reflects whether it could be stored.
    fn resolve(&self, attempt: &mut RecoveryAttempt, resolution: TaskResolution) {
        match self.ledger.resolve(&attempt.task_id, resolution) {
            Ok(()) => attempt.success = !attempt.is_abort(),
            Err(e) => self.remediation_failed(attempt, e),
        }
    }

    fn remediation_failed(&self, attempt: &mut RecoveryAttempt, e: OrchestratorError) {
        error!(
            task_id = %attempt.task_id,
            strategy = ?attempt.strategy,
            error = %e,
            "Remediation failed"
        );
        attempt.success = false;
        attempt.remediation_error = Some(e.to_string());
    }

    async fn record(&self, attempt: RecoveryAttempt) {
        self.attempts_lock().push(attempt.clone());

        if let Err(e) = self
            .audit
            .record(AuditRecord::RecoveryAttempt(attempt.clone()))
            .await
        {
            error!(
                task_id = %attempt.task_id,
                error = %e,
                "Failed to write recovery attempt to audit trail"
            );
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_attempt(&attempt);
        }
    }

    // ========================================================================
    // Queries and housekeeping
    // ========================================================================

    /// Attempts recorded for exactly this task.
    pub fn attempts(&self, task_id: &str) -> Vec<RecoveryAttempt> {
        self.attempts_lock()
            .iter()
            .filter(|attempt| attempt.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Attempts across the whole retry/resume chain of `task_id`, oldest first.
    pub fn lineage_attempts(&self, task_id: &str) -> Vec<RecoveryAttempt> {
        let root = self
            .ledger
            .lineage_root(task_id)
            .unwrap_or_else(|| task_id.to_string());
        self.attempts_lock()
            .iter()
            .filter(|attempt| attempt.root_task_id == root)
            .cloned()
            .collect()
    }

    pub fn all_attempts(&self) -> Vec<RecoveryAttempt> {
        self.attempts_lock().clone()
    }

    /// Forget attempts older than `older_than`. The audit sink keeps them.
    pub fn prune_attempts(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut attempts = self.attempts_lock();
        let before = attempts.len();
        attempts.retain(|attempt| attempt.timestamp >= cutoff);
        let pruned = before - attempts.len();
        if pruned > 0 {
            info!(pruned, "Pruned recovery attempts");
        }
        pruned
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let attempts = self.all_attempts();
        let mut stats = RecoveryStatistics {
            total_attempts: attempts.len(),
            ..Default::default()
        };

        let mut acted = 0usize;
        let mut acted_ok = 0usize;
        for attempt in &attempts {
            *stats.by_strategy.entry(attempt.strategy).or_insert(0) += 1;
            match attempt.abort_reason {
                Some(AbortReason::Fatal) => stats.aborted_fatal += 1,
                Some(AbortReason::Exhausted) => stats.aborted_exhausted += 1,
                None => {
                    acted += 1;
                    if attempt.success {
                        acted_ok += 1;
                    }
                }
            }

            let Some(successor) = &attempt.successor_task_id else {
                continue;
            };
            match self.ledger.get(successor).map(|task| task.status) {
                Some(TaskStatus::Success) => stats.successors_succeeded += 1,
                Some(TaskStatus::Failure | TaskStatus::Revoked) => stats.successors_failed += 1,
                _ => stats.successors_pending += 1,
            }
        }

        if acted > 0 {
            stats.remediation_success_rate = acted_ok as f64 / acted as f64;
        }
        let finished = stats.successors_succeeded + stats.successors_failed;
        if finished > 0 {
            stats.effective_recovery_rate =
                Some(stats.successors_succeeded as f64 / finished as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_wins_over_everything() {
        let config = RecoveryConfig::builder()
            .strategy(RecoveryStrategy::Manual)
            .build()
            .unwrap();
        assert_eq!(
            select_strategy(&config, FailureKind::Network, true),
            RecoveryStrategy::Manual
        );
    }

    #[test]
    fn checkpoint_prefers_resume() {
        let config = RecoveryConfig::default();
        assert_eq!(
            select_strategy(&config, FailureKind::Timeout, true),
            RecoveryStrategy::Resume
        );
        assert_eq!(
            select_strategy(&config, FailureKind::Timeout, false),
            RecoveryStrategy::Retry
        );
    }

    #[test]
    fn checkpoint_ignored_when_disabled() {
        let config = RecoveryConfig::builder()
            .use_checkpoint(false)
            .build()
            .unwrap();
        assert_eq!(
            select_strategy(&config, FailureKind::Network, true),
            RecoveryStrategy::Retry
        );
    }

    #[test]
    fn unlisted_kind_falls_back_to_default_strategy() {
        let config = RecoveryConfig::builder()
            .strategy(RecoveryStrategy::Skip)
            .build()
            .unwrap();
        assert_eq!(
            select_strategy(&config, FailureKind::Internal, false),
            RecoveryStrategy::Skip
        );
    }
}
