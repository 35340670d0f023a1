use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::monitor::HealthThresholds;

/// Orchestrator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root of the checkpoint store (`checkpoints/` and `index.json` live here)
    pub checkpoint_dir: PathBuf,
    pub max_checkpoints_per_task: usize,
    pub checkpoint_retention_days: u32,
    pub task_retention: chrono::Duration,
    pub audit_retention: chrono::Duration,
    pub monitor_interval: Duration,
    pub refresh_interval: Duration,
    pub cleanup_interval: Duration,
    pub tick_timeout: Duration,
    pub health_history: usize,
    pub health_thresholds: HealthThresholds,
    pub default_queue: String,
    pub local_concurrency: usize,
    pub audit_log_path: PathBuf,
    pub database_url: Option<String>,
    pub report_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let checkpoint_dir = PathBuf::from("./data/orchestrator");
        Self {
            audit_log_path: checkpoint_dir.join("recovery_audit.jsonl"),
            checkpoint_dir,
            max_checkpoints_per_task: 10,
            checkpoint_retention_days: 7,
            task_retention: chrono::Duration::hours(24),
            audit_retention: chrono::Duration::days(30),
            monitor_interval: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            tick_timeout: Duration::from_secs(10),
            health_history: 288,
            health_thresholds: HealthThresholds::default(),
            default_queue: "default".to_string(),
            local_concurrency: 4,
            database_url: None,
            report_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let checkpoint_dir = var("ORCHESTRATOR_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.checkpoint_dir);
        let audit_log_path = var("ORCHESTRATOR_AUDIT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| checkpoint_dir.join("recovery_audit.jsonl"));

        let thresholds = HealthThresholds {
            error_rate_warning: parse(
                var("ORCHESTRATOR_ERROR_RATE_WARNING"),
                "ORCHESTRATOR_ERROR_RATE_WARNING",
                defaults.health_thresholds.error_rate_warning,
            )?,
            error_rate_critical: parse(
                var("ORCHESTRATOR_ERROR_RATE_CRITICAL"),
                "ORCHESTRATOR_ERROR_RATE_CRITICAL",
                defaults.health_thresholds.error_rate_critical,
            )?,
            wait_warning_secs: parse(
                var("ORCHESTRATOR_WAIT_WARNING_SECS"),
                "ORCHESTRATOR_WAIT_WARNING_SECS",
                defaults.health_thresholds.wait_warning_secs,
            )?,
            wait_critical_secs: parse(
                var("ORCHESTRATOR_WAIT_CRITICAL_SECS"),
                "ORCHESTRATOR_WAIT_CRITICAL_SECS",
                defaults.health_thresholds.wait_critical_secs,
            )?,
            queue_depth_warning: parse(
                var("ORCHESTRATOR_QUEUE_DEPTH_WARNING"),
                "ORCHESTRATOR_QUEUE_DEPTH_WARNING",
                defaults.health_thresholds.queue_depth_warning,
            )?,
            queue_depth_critical: parse(
                var("ORCHESTRATOR_QUEUE_DEPTH_CRITICAL"),
                "ORCHESTRATOR_QUEUE_DEPTH_CRITICAL",
                defaults.health_thresholds.queue_depth_critical,
            )?,
        };

        let task_retention_hours: i64 = parse(
            var("ORCHESTRATOR_TASK_RETENTION_HOURS"),
            "ORCHESTRATOR_TASK_RETENTION_HOURS",
            defaults.task_retention.num_hours(),
        )?;
        let audit_retention_days: i64 = parse(
            var("ORCHESTRATOR_AUDIT_RETENTION_DAYS"),
            "ORCHESTRATOR_AUDIT_RETENTION_DAYS",
            defaults.audit_retention.num_days(),
        )?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints_per_task: parse(
                var("ORCHESTRATOR_MAX_CHECKPOINTS"),
                "ORCHESTRATOR_MAX_CHECKPOINTS",
                defaults.max_checkpoints_per_task,
            )?,
            checkpoint_retention_days: parse(
                var("ORCHESTRATOR_CHECKPOINT_RETENTION_DAYS"),
                "ORCHESTRATOR_CHECKPOINT_RETENTION_DAYS",
                defaults.checkpoint_retention_days,
            )?,
            task_retention: chrono::Duration::try_hours(task_retention_hours)
                .context("ORCHESTRATOR_TASK_RETENTION_HOURS is out of range")?,
            audit_retention: chrono::Duration::try_days(audit_retention_days)
                .context("ORCHESTRATOR_AUDIT_RETENTION_DAYS is out of range")?,
            monitor_interval: seconds(
                var("ORCHESTRATOR_MONITOR_INTERVAL_SECS"),
                "ORCHESTRATOR_MONITOR_INTERVAL_SECS",
                defaults.monitor_interval,
            )?,
            refresh_interval: seconds(
                var("ORCHESTRATOR_REFRESH_INTERVAL_SECS"),
                "ORCHESTRATOR_REFRESH_INTERVAL_SECS",
                defaults.refresh_interval,
            )?,
            cleanup_interval: seconds(
                var("ORCHESTRATOR_CLEANUP_INTERVAL_SECS"),
                "ORCHESTRATOR_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            )?,
            tick_timeout: seconds(
                var("ORCHESTRATOR_TICK_TIMEOUT_SECS"),
                "ORCHESTRATOR_TICK_TIMEOUT_SECS",
                defaults.tick_timeout,
            )?,
            health_history: parse(
                var("ORCHESTRATOR_HEALTH_HISTORY"),
                "ORCHESTRATOR_HEALTH_HISTORY",
                defaults.health_history,
            )?,
            health_thresholds: thresholds,
            default_queue: var("ORCHESTRATOR_DEFAULT_QUEUE").unwrap_or(defaults.default_queue),
            local_concurrency: parse(
                var("ORCHESTRATOR_CONCURRENCY"),
                "ORCHESTRATOR_CONCURRENCY",
                defaults.local_concurrency,
            )?,
            audit_log_path,
            database_url: var("DATABASE_URL"),
            report_path: var("ORCHESTRATOR_REPORT_PATH").map(PathBuf::from),
        })
    }
}

fn parse<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}

fn seconds(value: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = parse(value, key, default.as_secs())?;
    anyhow::ensure!(secs > 0, "{key} must be positive");
    Ok(Duration::from_secs(secs))
}
