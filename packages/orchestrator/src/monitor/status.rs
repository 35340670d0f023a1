//! Fleet health derived from the ledger and engine introspection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::tasks::TaskLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub wait_warning_secs: f64,
    pub wait_critical_secs: f64,
    pub queue_depth_warning: usize,
    pub queue_depth_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_warning: 0.10,
            error_rate_critical: 0.25,
            wait_warning_secs: 60.0,
            wait_critical_secs: 300.0,
            queue_depth_warning: 100,
            queue_depth_critical: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub online: bool,
    pub active: usize,
    pub concurrency: usize,
    pub load: f64,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,
    /// Eligible to run, waiting for a worker
    pub pending: usize,
    /// Waiting on an eta/countdown
    pub scheduled: usize,
    pub active: usize,
    pub failed: usize,
}

impl QueueStatus {
    pub fn depth(&self) -> usize {
        self.pending + self.scheduled
    }
}

/// One point of the health time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub timestamp: DateTime<Utc>,
    pub level: HealthLevel,
    pub error_rate: f64,
    pub success_rate: f64,
    pub avg_response_secs: Option<f64>,
    pub avg_wait_secs: Option<f64>,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub workers: Vec<WorkerStatus>,
    pub queues: Vec<QueueStatus>,
    /// Submissions attributed to each schedule so far
    pub schedule_runs: HashMap<String, u64>,
    pub alerts: Vec<String>,
}

/// Inputs to [`assess`], already aggregated.
#[derive(Debug, Clone, Default)]
pub struct HealthSignals<'a> {
    pub error_rate: f64,
    pub avg_wait_secs: Option<f64>,
    pub queues: &'a [QueueStatus],
    pub workers: &'a [WorkerStatus],
}

/// Derive a health level and alert strings from aggregated signals.
pub fn assess(signals: &HealthSignals<'_>, thresholds: &HealthThresholds) -> (HealthLevel, Vec<String>) {
    let mut level = HealthLevel::Healthy;
    let mut alerts = Vec::new();
    let mut raise = |severity: HealthLevel, alert: String| {
        level = level.max(severity);
        alerts.push(alert);
    };

    if signals.error_rate >= thresholds.error_rate_critical {
        raise(
            HealthLevel::Critical,
            format!("Error rate {:.1}% is critical", signals.error_rate * 100.0),
        );
    } else if signals.error_rate >= thresholds.error_rate_warning {
        raise(
            HealthLevel::Warning,
            format!("Error rate {:.1}% is elevated", signals.error_rate * 100.0),
        );
    }

    if let Some(wait) = signals.avg_wait_secs {
        if wait >= thresholds.wait_critical_secs {
            raise(HealthLevel::Critical, format!("Average wait time {wait:.0}s is critical"));
        } else if wait >= thresholds.wait_warning_secs {
            raise(HealthLevel::Warning, format!("Average wait time {wait:.0}s is elevated"));
        }
    }

    for queue in signals.queues {
        let depth = queue.depth();
        if depth >= thresholds.queue_depth_critical {
            raise(
                HealthLevel::Critical,
                format!("Queue '{}' backlog of {depth} tasks is critical", queue.queue),
            );
        } else if depth >= thresholds.queue_depth_warning {
            raise(
                HealthLevel::Warning,
                format!("Queue '{}' backlog of {depth} tasks is elevated", queue.queue),
            );
        }
    }

    let offline: Vec<&str> = signals
        .workers
        .iter()
        .filter(|worker| !worker.online)
        .map(|worker| worker.worker.as_str())
        .collect();
    if !signals.workers.is_empty() && offline.len() == signals.workers.len() {
        raise(HealthLevel::Critical, "No workers online".to_string());
    } else if !offline.is_empty() {
        raise(
            HealthLevel::Warning,
            format!("Workers offline: {}", offline.join(", ")),
        );
    }

    (level, alerts)
}

fn queue_entry<'a>(queues: &'a mut BTreeMap<String, QueueStatus>, name: &str) -> &'a mut QueueStatus {
    queues.entry(name.to_string()).or_insert_with(|| QueueStatus {
        queue: name.to_string(),
        ..Default::default()
    })
}

pub struct StatusMonitor {
    ledger: Arc<TaskLedger>,
    thresholds: HealthThresholds,
    tick_timeout: Duration,
    capacity: usize,
    history: Mutex<VecDeque<SystemHealth>>,
}

impl StatusMonitor {
    pub fn new(ledger: Arc<TaskLedger>, thresholds: HealthThresholds) -> Self {
        Self {
            ledger,
            thresholds,
            tick_timeout: Duration::from_secs(10),
            capacity: 288,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Deadline for one poll of the engine.
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    /// Number of snapshots kept.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    fn history_lock(&self) -> MutexGuard<'_, VecDeque<SystemHealth>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll the engine once, bounded by the tick deadline, and record a snapshot.
    pub async fn tick(&self) -> Result<SystemHealth> {
        let health = tokio::time::timeout(self.tick_timeout, self.collect())
            .await
            .map_err(|_| OrchestratorError::Timeout(self.tick_timeout))??;

        let previous = {
            let mut history = self.history_lock();
            let previous = history.back().map(|snapshot| snapshot.level);
            history.push_back(health.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
            previous
        };

        if previous != Some(health.level) && health.level != HealthLevel::Healthy {
            warn!(level = ?health.level, alerts = ?health.alerts, "System health degraded");
        } else {
            debug!(level = ?health.level, "Health snapshot recorded");
        }
        Ok(health)
    }

    async fn collect(&self) -> Result<SystemHealth> {
        let stats = self.ledger.statistics().await?;
        let engine = self.ledger.engine();
        let (active, scheduled, reserved) = futures::try_join!(
            engine.inspect_active(),
            engine.inspect_scheduled(),
            engine.inspect_reserved(),
        )?;

        let mut queues: BTreeMap<String, QueueStatus> = BTreeMap::new();
        for info in &active {
            queue_entry(&mut queues, &info.queue).active += 1;
        }
        for info in &scheduled {
            queue_entry(&mut queues, &info.queue).scheduled += 1;
        }
        for info in &reserved {
            queue_entry(&mut queues, &info.queue).pending += 1;
        }
        for (name, failed) in &stats.failed_by_queue {
            queue_entry(&mut queues, name).failed += failed;
        }
        let queues: Vec<QueueStatus> = queues.into_values().collect();

        let workers: Vec<WorkerStatus> = stats
            .worker_stats
            .iter()
            .map(|worker| WorkerStatus {
                worker: worker.worker.clone(),
                online: worker.online,
                active: worker.active,
                concurrency: worker.concurrency,
                load: worker.load(),
                processed: worker.processed,
                failed: worker.failed,
            })
            .collect();

        let (level, alerts) = assess(
            &HealthSignals {
                error_rate: stats.recent_error_rate,
                avg_wait_secs: stats.avg_wait_secs,
                queues: &queues,
                workers: &workers,
            },
            &self.thresholds,
        );

        Ok(SystemHealth {
            timestamp: Utc::now(),
            level,
            error_rate: stats.recent_error_rate,
            success_rate: stats.recent_success_rate,
            avg_response_secs: stats.avg_runtime_secs,
            avg_wait_secs: stats.avg_wait_secs,
            total_tasks: stats.total,
            active_tasks: active.len(),
            pending_tasks: scheduled.len() + reserved.len(),
            workers,
            queues,
            schedule_runs: stats.schedule_submissions,
            alerts,
        })
    }

    pub fn latest(&self) -> Option<SystemHealth> {
        self.history_lock().back().cloned()
    }

    /// Snapshots at or after `since` (all when `None`), oldest first.
    pub fn history(&self, since: Option<DateTime<Utc>>) -> Vec<SystemHealth> {
        self.history_lock()
            .iter()
            .filter(|snapshot| since.map_or(true, |since| snapshot.timestamp >= since))
            .cloned()
            .collect()
    }

    pub fn is_critical(&self) -> bool {
        self.latest()
            .is_some_and(|snapshot| snapshot.level == HealthLevel::Critical)
    }
}
