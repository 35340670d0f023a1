//! Typed errors for the orchestration core.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match on
//! what went wrong. Failures reported by task handlers are classified once, at
//! the engine boundary, into the closed [`FailureKind`] enum; recovery policy
//! compares kinds by value rather than by error text.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy used for reporting and remediation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout class, eligible for retry or resume.
    Transient,
    /// Authentication, permission or invalid data; never remediated automatically.
    Fatal,
    /// Checkpoint checksum mismatch.
    Integrity,
    /// Retry budget exceeded.
    Exhaustion,
    /// Unknown task, checkpoint or schedule.
    NotFound,
}

/// Closed set of failure kinds a task handler can report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    ConnectionReset,
    RateLimited,
    ServiceUnavailable,
    /// The worker running the task disappeared mid-flight.
    WorkerLost,
    Authentication,
    Permission,
    InvalidData,
    Cancelled,
    #[default]
    Internal,
}

impl FailureKind {
    /// Kinds that usually clear up on their own.
    pub const TRANSIENT: [FailureKind; 6] = [
        FailureKind::Network,
        FailureKind::Timeout,
        FailureKind::ConnectionReset,
        FailureKind::RateLimited,
        FailureKind::ServiceUnavailable,
        FailureKind::WorkerLost,
    ];

    /// Kinds that will fail the same way on every attempt.
    pub const FATAL: [FailureKind; 3] = [
        FailureKind::Authentication,
        FailureKind::Permission,
        FailureKind::InvalidData,
    ];

    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }

    pub fn is_fatal(&self) -> bool {
        Self::FATAL.contains(self)
    }

    /// Taxonomy class, if the kind has an inherent one.
    ///
    /// `Internal` and `Cancelled` carry no class; policy decides for them.
    pub fn class(&self) -> Option<ErrorClass> {
        if self.is_transient() {
            Some(ErrorClass::Transient)
        } else if self.is_fatal() {
            Some(ErrorClass::Fatal)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionReset => "connection_reset",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServiceUnavailable => "service_unavailable",
            FailureKind::WorkerLost => "worker_lost",
            FailureKind::Authentication => "authentication",
            FailureKind::Permission => "permission",
            FailureKind::InvalidData => "invalid_data",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&io::Error> for FailureKind {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => FailureKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::AddrInUse => FailureKind::Network,
            io::ErrorKind::PermissionDenied => FailureKind::Permission,
            io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::UnexpectedEof => FailureKind::InvalidData,
            io::ErrorKind::Interrupted => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }
}

/// A failure reported by a task handler, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<io::Error> for TaskError {
    fn from(err: io::Error) -> Self {
        Self::new(FailureKind::from(&err), err.to_string())
    }
}

/// Errors returned by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task is unknown to both the ledger and the execution engine
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Checkpoint does not exist or failed verification
    #[error("checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    /// No schedule with this name
    #[error("schedule not found: {name}")]
    ScheduleNotFound { name: String },

    /// Task type was never registered with the ledger
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// Schedule definition rejected during validation
    #[error("invalid schedule {name}: {reason}")]
    InvalidSchedule { name: String, reason: String },

    /// Task arguments rejected during validation
    #[error("invalid payload for {task_name}: {reason}")]
    InvalidPayload { task_name: String, reason: String },

    /// Recovery configuration rejected during validation
    #[error("invalid recovery config for {task_name}: {reason}")]
    InvalidRecoveryConfig { task_name: String, reason: String },

    /// Caller passed a value outside the accepted range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Stored checkpoint content does not match its checksum
    #[error("checkpoint {checkpoint_id} failed integrity check")]
    Integrity { checkpoint_id: String },

    /// Retry budget used up
    #[error("recovery budget exhausted for {task_id} after {attempts} attempts")]
    Exhausted { task_id: String, attempts: u32 },

    /// Another resume or recovery for the same task is being submitted
    #[error("remediation already in progress for {task_id}")]
    RemediationInProgress { task_id: String },

    /// An earlier retry or resume of the task has not finished yet
    #[error("task {task_id} already has a live successor {successor_task_id}")]
    SuccessorLive {
        task_id: String,
        successor_task_id: String,
    },

    /// Task is not in a state that allows resume or restart
    #[error("task {task_id} cannot be resumed: {reason}")]
    NotResumable { task_id: String, reason: String },

    /// Execution engine rejected or failed a call
    #[error("execution engine error ({kind}): {message}")]
    Engine { kind: FailureKind, message: String },

    /// Audit trail write failed
    #[error("audit sink error: {0}")]
    Audit(String),

    /// Deadline elapsed before the operation finished
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Filesystem operation failed
    #[error("storage error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn engine(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Engine {
            kind,
            message: message.into(),
        }
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Map the error onto the taxonomy used for reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::TaskNotFound { .. }
            | OrchestratorError::CheckpointNotFound { .. }
            | OrchestratorError::ScheduleNotFound { .. }
            | OrchestratorError::UnknownTaskType(_) => ErrorClass::NotFound,
            OrchestratorError::Integrity { .. } => ErrorClass::Integrity,
            OrchestratorError::Exhausted { .. } => ErrorClass::Exhaustion,
            OrchestratorError::Engine { kind, .. } => kind.class().unwrap_or(ErrorClass::Transient),
            OrchestratorError::Timeout(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Audit(_)
            | OrchestratorError::RemediationInProgress { .. }
            | OrchestratorError::SuccessorLive { .. } => ErrorClass::Transient,
            OrchestratorError::InvalidSchedule { .. }
            | OrchestratorError::InvalidPayload { .. }
            | OrchestratorError::InvalidRecoveryConfig { .. }
            | OrchestratorError::InvalidArgument(_)
            | OrchestratorError::NotResumable { .. }
            | OrchestratorError::Json(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
