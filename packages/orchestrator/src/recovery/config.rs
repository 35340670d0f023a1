use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Resubmit the same task after a backoff delay
    #[default]
    Retry,
    /// Successor seeded from the latest checkpoint
    Resume,
    /// Successor from scratch; checkpoints are discarded
    Restart,
    Skip,
    Manual,
    /// No remediation; only ever recorded, never configured
    Abort,
}

impl RecoveryStrategy {
    /// Counts against the retry budget.
    pub fn is_remediation(&self) -> bool {
        matches!(
            self,
            RecoveryStrategy::Retry | RecoveryStrategy::Resume | RecoveryStrategy::Restart
        )
    }
}

/// Per task-type failure policy. Validated on construction and not changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    max_retries: u32,
    retry_delay: Duration,
    backoff_factor: f64,
    max_retry_delay: Duration,
    strategy: RecoveryStrategy,
    use_checkpoint: bool,
    retry_on: BTreeSet<FailureKind>,
    stop_on: BTreeSet<FailureKind>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(3600),
            strategy: RecoveryStrategy::Retry,
            use_checkpoint: true,
            retry_on: FailureKind::TRANSIENT.into_iter().collect(),
            stop_on: FailureKind::FATAL.into_iter().collect(),
        }
    }
}

impl RecoveryConfig {
    pub fn builder() -> RecoveryConfigBuilder {
        RecoveryConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.strategy
    }

    pub fn use_checkpoint(&self) -> bool {
        self.use_checkpoint
    }

    pub fn retries_on(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    pub fn stops_on(&self, kind: FailureKind) -> bool {
        self.stop_on.contains(&kind)
    }

    /// `min(retry_delay * backoff_factor^n, max_retry_delay)` for the n-th retry (0-based).
    pub fn retry_delay_for(&self, retry: u32) -> Duration {
        let max = self.max_retry_delay.as_secs_f64();
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay = self.retry_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay.is_finite() || delay >= max {
            self.max_retry_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.max_retry_delay < self.retry_delay {
            return Err(format!(
                "max_retry_delay ({:?}) is shorter than retry_delay ({:?})",
                self.max_retry_delay, self.retry_delay
            ));
        }
        if self.strategy == RecoveryStrategy::Abort {
            return Err("abort is an outcome, not a configurable strategy".into());
        }
        if let Some(kind) = self.retry_on.intersection(&self.stop_on).next() {
            return Err(format!("{kind} is in both retry_on and stop_on"));
        }
        Ok(())
    }
}

pub struct RecoveryConfigBuilder {
    config: RecoveryConfig,
}

impl RecoveryConfigBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn use_checkpoint(mut self, use_checkpoint: bool) -> Self {
        self.config.use_checkpoint = use_checkpoint;
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.config.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn stop_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.config.stop_on = kinds.into_iter().collect();
        self
    }

    /// Validate and freeze. `task_name` only labels the error.
    pub fn build_for(self, task_name: &str) -> Result<RecoveryConfig> {
        self.config
            .validate()
            .map_err(|reason| OrchestratorError::InvalidRecoveryConfig {
                task_name: task_name.to_string(),
                reason,
            })?;
        Ok(self.config)
    }

    pub fn build(self) -> Result<RecoveryConfig> {
        self.build_for("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RecoveryConfig::default();
        let delays: Vec<u64> = (0..8).map(|n| config.retry_delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(RecoveryConfig::builder().backoff_factor(0.5).build().is_err());
        assert!(RecoveryConfig::builder()
            .retry_delay(Duration::from_secs(120))
            .max_retry_delay(Duration::from_secs(60))
            .build()
            .is_err());
        assert!(RecoveryConfig::builder()
            .strategy(RecoveryStrategy::Abort)
            .build()
            .is_err());
        let err = RecoveryConfig::builder()
            .retry_on([FailureKind::Network])
            .stop_on([FailureKind::Network])
            .build_for("crawl_site")
            .unwrap_err();
        assert!(err.to_string().contains("crawl_site"));
    }

    #[test]
    fn defaults_split_transient_and_fatal() {
        let config = RecoveryConfig::default();
        assert!(config.retries_on(FailureKind::Timeout));
        assert!(config.stops_on(FailureKind::Authentication));
        assert!(!config.retries_on(FailureKind::Internal));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(
            delay in 1u64..600,
            factor in 1.0f64..4.0,
            cap in 600u64..7200,
            n in 0u32..40,
        ) {
            let config = RecoveryConfig::builder()
                .retry_delay(Duration::from_secs(delay))
                .backoff_factor(factor)
                .max_retry_delay(Duration::from_secs(cap))
                .build()
                .unwrap();
            let current = config.retry_delay_for(n);
            let next = config.retry_delay_for(n + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_secs(cap));
            prop_assert!(config.retry_delay_for(0) >= Duration::from_secs(delay.min(cap)));
        }
    }
}
