//! Failure recovery: per task-type policy and the engine that applies it.

mod attempt;
mod config;
mod policy;

pub use attempt::{AbortReason, RecoveryAttempt, RecoveryObserver, RecoveryOutcome, RecoveryStatistics};
pub use config::{RecoveryConfig, RecoveryConfigBuilder, RecoveryStrategy};
pub use policy::{select_strategy, RecoveryPolicyEngine};
