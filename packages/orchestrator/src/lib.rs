//! Task orchestration and recovery core.
//!
//! Background work for the harvesting platform (crawls, extractions, syncs)
//! is submitted to an external execution engine. This crate owns everything
//! around that boundary:
//! - [`TaskLedger`] - creates, tracks and cancels tasks; source of truth for status
//! - [`Scheduler`] - one-shot, delayed, interval, cron and batched schedules
//! - [`CheckpointStore`] - checksummed, file-backed progress snapshots
//! - [`RecoveryPolicyEngine`] - decides how a failed task is remediated
//! - [`ResumeCoordinator`] - creates successor tasks from checkpoints
//! - [`ProgressMonitor`] / [`StatusMonitor`] - throughput, ETAs and fleet health
//!
//! # Architecture
//!
//! ```text
//! Scheduler ─► TaskLedger ─► ExecutionEngine (external)
//!                  ▲              │
//!                  │              ▼ failure
//!     ResumeCoordinator ◄── RecoveryPolicyEngine ──► AuditSink
//!                  │              │
//!                  └──► CheckpointStore ◄┘
//!
//! StatusMonitor / ProgressMonitor observe the ledger and engine.
//! ```
//!
//! Everything is wired once by [`OrchestrationContext`], which also owns the
//! periodic loops and their shutdown.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod recovery;
pub mod report;
pub mod resume;
pub mod scheduler;
pub mod tasks;

pub use audit::{AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink, NoopAuditSink};
pub use checkpoint::{Checkpoint, CheckpointStore, ProgressData};
pub use config::OrchestratorConfig;
pub use context::{CleanupSummary, OrchestrationContext, OrchestrationContextBuilder};
pub use engine::{
    handler_fn, EngineRetryPolicy, EngineTaskInfo, EngineTaskState, ExecutionEngine, LocalEngine,
    LocalEngineConfig, MemoryEngine, PeriodicSpec, PeriodicTrigger, RevokeOutcome, SubmitRequest,
    TaskHandler, TaskInvocation, WorkerStats,
};
pub use error::{ErrorClass, FailureKind, OrchestratorError, Result, TaskError};
pub use monitor::{
    HealthLevel, HealthThresholds, ProgressMonitor, ProgressSummary, QueueStatus,
    StatusMonitor, SystemHealth, WorkerStatus,
};
pub use recovery::{
    AbortReason, RecoveryAttempt, RecoveryConfig, RecoveryConfigBuilder, RecoveryObserver,
    RecoveryOutcome, RecoveryPolicyEngine, RecoveryStatistics, RecoveryStrategy,
};
pub use report::SystemReport;
pub use resume::{ResumeContext, ResumeCoordinator, ResumeOption, ResumeResult, ResumeStrategy};
pub use scheduler::{
    CronExpression, ScheduleConfig, ScheduleMetadata, ScheduleStatus, ScheduleType, Scheduler,
};
pub use tasks::{
    BatchTag, CreateTask, ResumeMarker, Task, TaskDefinition, TaskLedger, TaskMetadata,
    TaskPriority, TaskResolution, TaskStatistics, TaskStatus, TaskTransition,
};
