//! Wires every component once and runs the background loops.
//!
//! ```text
//! OrchestrationContext
//!     │
//!     ├─► status loop   (StatusMonitor::tick every monitor_interval)
//!     ├─► refresh loop  (TaskLedger::refresh → RecoveryPolicyEngine::handle_failure)
//!     └─► cleanup loop  (retention for tasks, checkpoints, attempts, contexts)
//! ```
//!
//! Each loop tick is deadline-bounded and isolated; `shutdown` cancels all of
//! them and waits for the loops to exit.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, JsonlAuditSink};
use crate::checkpoint::{CheckpointStore, ProgressData};
use crate::config::OrchestratorConfig;
use crate::engine::ExecutionEngine;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::monitor::{spawn_periodic, ProgressMonitor, StatusMonitor};
use crate::recovery::{RecoveryConfig, RecoveryOutcome, RecoveryPolicyEngine};
use crate::report::SystemReport;
use crate::resume::ResumeCoordinator;
use crate::scheduler::Scheduler;
use crate::tasks::{TaskDefinition, TaskLedger, TaskStatus};

/// What one cleanup pass reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub tasks_purged: usize,
    pub checkpoints_expired: usize,
    pub attempts_pruned: usize,
    pub contexts_removed: usize,
    pub progress_forgotten: usize,
}

pub struct OrchestrationContextBuilder {
    config: OrchestratorConfig,
    engine: Option<Arc<dyn ExecutionEngine>>,
    audit: Option<Arc<dyn AuditSink>>,
    definitions: Vec<TaskDefinition>,
    default_recovery: Option<RecoveryConfig>,
}

impl OrchestrationContextBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Defaults to a JSON-lines log at `config.audit_log_path`.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn definition(mut self, definition: TaskDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Recovery policy for task types without their own.
    pub fn default_recovery(mut self, config: RecoveryConfig) -> Self {
        self.default_recovery = Some(config);
        self
    }

    pub async fn build(self) -> Result<OrchestrationContext> {
        let config = self.config;
        let engine = self.engine.ok_or_else(|| {
            OrchestratorError::InvalidArgument("an execution engine is required".into())
        })?;
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(JsonlAuditSink::new(config.audit_log_path.clone())),
        };

        let ledger = Arc::new(TaskLedger::new(engine).with_default_queue(config.default_queue.clone()));
        for definition in self.definitions {
            ledger.register(definition);
        }

        let checkpoints = Arc::new(
            CheckpointStore::open(
                config.checkpoint_dir.clone(),
                config.max_checkpoints_per_task,
                audit.clone(),
            )
            .await?,
        );
        let coordinator = Arc::new(ResumeCoordinator::new(ledger.clone(), checkpoints.clone()));
        let status = Arc::new(
            StatusMonitor::new(ledger.clone(), config.health_thresholds.clone())
                .with_tick_timeout(config.tick_timeout)
                .with_capacity(config.health_history),
        );
        let recovery = Arc::new(
            RecoveryPolicyEngine::new(ledger.clone(), coordinator.clone(), audit.clone())
                .with_default_config(self.default_recovery.unwrap_or_default())
                .with_health(status.clone()),
        );
        let scheduler = Arc::new(Scheduler::new(ledger.clone()));

        Ok(OrchestrationContext {
            config,
            ledger,
            scheduler,
            checkpoints,
            recovery,
            coordinator,
            progress: Arc::new(ProgressMonitor::default()),
            status,
            audit,
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        })
    }
}

pub struct OrchestrationContext {
    config: OrchestratorConfig,
    ledger: Arc<TaskLedger>,
    scheduler: Arc<Scheduler>,
    checkpoints: Arc<CheckpointStore>,
    recovery: Arc<RecoveryPolicyEngine>,
    coordinator: Arc<ResumeCoordinator>,
    progress: Arc<ProgressMonitor>,
    status: Arc<StatusMonitor>,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestrationContext {
    pub fn builder() -> OrchestrationContextBuilder {
        OrchestrationContextBuilder {
            config: OrchestratorConfig::default(),
            engine: None,
            audit: None,
            definitions: Vec::new(),
            default_recovery: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn recovery(&self) -> &Arc<RecoveryPolicyEngine> {
        &self.recovery
    }

    pub fn coordinator(&self) -> &Arc<ResumeCoordinator> {
        &self.coordinator
    }

    pub fn progress(&self) -> &Arc<ProgressMonitor> {
        &self.progress
    }

    pub fn status(&self) -> &Arc<StatusMonitor> {
        &self.status
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the status, refresh and cleanup loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        if !loops.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let deadline = self.config.tick_timeout;

        let ctx = self.clone();
        loops.push(spawn_periodic(
            "status",
            self.config.monitor_interval,
            deadline,
            self.cancel.child_token(),
            move || {
                let ctx = ctx.clone();
                async move { ctx.status.tick().await.map(|_| ()) }
            },
        ));

        let ctx = self.clone();
        loops.push(spawn_periodic(
            "refresh",
            self.config.refresh_interval,
            deadline,
            self.cancel.child_token(),
            move || {
                let ctx = ctx.clone();
                async move { ctx.dispatch_failures().await.map(|_| ()) }
            },
        ));

        // Cleanup walks the whole store, so it gets a full interval to finish
        let ctx = self.clone();
        loops.push(spawn_periodic(
            "cleanup",
            self.config.cleanup_interval,
            self.config.cleanup_interval,
            self.cancel.child_token(),
            move || {
                let ctx = ctx.clone();
                async move { ctx.run_cleanup().await.map(|_| ()) }
            },
        ));

        info!(
            monitor_interval_secs = self.config.monitor_interval.as_secs(),
            refresh_interval_secs = self.config.refresh_interval.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Orchestration loops started"
        );
    }

    /// Cancel the loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orchestration loop ended abnormally");
            }
        }
        info!("Orchestration context stopped");
    }

    // ========================================================================
    // Loop bodies
    // ========================================================================

    /// Reconcile the ledger with the engine and hand new failures to recovery.
    ///
    /// Returns the outcomes of failures handled by this call only.
    pub async fn dispatch_failures(&self) -> Result<Vec<RecoveryOutcome>> {
        let transitions = self.ledger.refresh().await?;
        self.observe_progress();

        let mut outcomes = Vec::new();
        for transition in transitions {
            if transition.to != TaskStatus::Failure {
                continue;
            }
            let (message, kind) = self
                .ledger
                .get(&transition.task_id)
                .and_then(|task| task.error)
                .map(|error| (error.message, error.kind))
                .unwrap_or_else(|| ("task failed without an error report".into(), FailureKind::Internal));

            match self
                .recovery
                .handle_failure(&transition.task_id, &message, kind)
                .await
            {
                Ok(outcome) if outcome.already_handled => {
                    debug!(task_id = %transition.task_id, "Failure was handled directly");
                }
                Ok(outcome) => outcomes.push(outcome),
                Err(OrchestratorError::RemediationInProgress { task_id }) => {
                    debug!(task_id = %task_id, "Failure already being handled");
                }
                Err(OrchestratorError::SuccessorLive {
                    task_id,
                    successor_task_id,
                }) => {
                    debug!(
                        task_id = %task_id,
                        successor_task_id = %successor_task_id,
                        "Failure already remediated by a live successor"
                    );
                }
                Err(e) => {
                    warn!(task_id = %transition.task_id, error = %e, "Could not handle task failure");
                }
            }
        }
        Ok(outcomes)
    }

    /// Feed `{current, total, description}` progress reports into the progress monitor.
    fn observe_progress(&self) {
        for task in self.ledger.tasks() {
            if !task.status.is_active() {
                continue;
            }
            let Some(progress) = task.progress.as_ref() else {
                continue;
            };
            let (Some(current), Some(total)) = (
                progress.get("current").and_then(|v| v.as_u64()),
                progress.get("total").and_then(|v| v.as_u64()),
            ) else {
                continue;
            };
            let description = progress
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            self.progress.record(
                &task.task_id,
                ProgressData::new(current, total, description),
                Utc::now(),
            );
        }
    }

    /// One retention pass over every component.
    pub async fn run_cleanup(&self) -> Result<CleanupSummary> {
        let summary = CleanupSummary {
            tasks_purged: self.ledger.purge_terminal(self.config.task_retention),
            checkpoints_expired: self
                .checkpoints
                .cleanup_older_than(self.config.checkpoint_retention_days)
                .await?,
            attempts_pruned: self.recovery.prune_attempts(self.config.audit_retention),
            contexts_removed: self.coordinator.cleanup_contexts().await,
            progress_forgotten: self
                .progress
                .forget_stale(Utc::now() - self.config.task_retention),
        };
        info!(?summary, "Cleanup pass finished");
        Ok(summary)
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Snapshot of every component. Engine failures are noted, not raised.
    pub async fn system_report(&self) -> SystemReport {
        let mut errors = Vec::new();
        let task_statistics = match self.ledger.statistics().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                errors.push(format!("task statistics unavailable: {e}"));
                None
            }
        };

        SystemReport {
            generated_at: Utc::now(),
            health: self.status.latest(),
            task_statistics,
            recovery: self.recovery.statistics(),
            schedules: self.scheduler.list(),
            progress: self.progress.summaries(),
            resume_contexts: self.coordinator.contexts_snapshot(),
            tasks_with_checkpoints: self.checkpoints.tasks_with_checkpoints().await,
            errors,
        }
    }

    pub async fn export_system_report(&self, path: impl AsRef<Path>) -> Result<SystemReport> {
        let report = self.system_report().await;
        report.write_to(path.as_ref()).await?;
        info!(path = %path.as_ref().display(), "System report exported");
        Ok(report)
    }
}
