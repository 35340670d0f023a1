//! Durable audit trail for recovery decisions and checkpoint changes.
//!
//! Every [`RecoveryAttempt`] and every checkpoint create/remove is written
//! to an [`AuditSink`], tagged with task and checkpoint ids so operators can
//! reconcile what the orchestrator did after the fact.

mod jsonl;
#[cfg(feature = "postgres")]
mod postgres;

pub use jsonl::JsonlAuditSink;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditSink;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::recovery::RecoveryAttempt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum AuditRecord {
    RecoveryAttempt(RecoveryAttempt),
    CheckpointCreated {
        task_id: String,
        task_name: String,
        checkpoint_id: String,
        checksum: String,
        percent: f64,
        timestamp: DateTime<Utc>,
    },
    CheckpointRemoved {
        task_id: String,
        checkpoint_id: String,
        /// Why it went away: removed, evicted, cleared, expired
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl AuditRecord {
    pub fn record_type(&self) -> &'static str {
        match self {
            AuditRecord::RecoveryAttempt(_) => "recovery_attempt",
            AuditRecord::CheckpointCreated { .. } => "checkpoint_created",
            AuditRecord::CheckpointRemoved { .. } => "checkpoint_removed",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            AuditRecord::RecoveryAttempt(attempt) => &attempt.task_id,
            AuditRecord::CheckpointCreated { task_id, .. }
            | AuditRecord::CheckpointRemoved { task_id, .. } => task_id,
        }
    }

    pub fn checkpoint_id(&self) -> Option<&str> {
        match self {
            AuditRecord::RecoveryAttempt(attempt) => attempt.checkpoint_id.as_deref(),
            AuditRecord::CheckpointCreated { checkpoint_id, .. }
            | AuditRecord::CheckpointRemoved { checkpoint_id, .. } => Some(checkpoint_id),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::RecoveryAttempt(attempt) => attempt.timestamp,
            AuditRecord::CheckpointCreated { timestamp, .. }
            | AuditRecord::CheckpointRemoved { timestamp, .. } => *timestamp,
        }
    }
}

/// Where audit records go.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory; used in tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn recovery_attempts(&self) -> Vec<RecoveryAttempt> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                AuditRecord::RecoveryAttempt(attempt) => Some(attempt),
                _ => None,
            })
            .collect()
    }

    pub fn for_task(&self, task_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.task_id() == task_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}
