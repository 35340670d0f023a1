//! Declarative schedules turned into ledger submissions.
//!
//! Once and Delayed schedules submit a single task through the ledger.
//! Interval and Cron schedules are handed to the engine's periodic facility,
//! which submits on every trigger. The schedule table lock is never held
//! across a ledger or engine call.

mod config;
mod cron;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::{ScheduleConfig, ScheduleMetadata, ScheduleType, ENGINE_RETRY_INTERVAL};
pub use cron::CronExpression;

use crate::engine::PeriodicSpec;
use crate::error::{OrchestratorError, Result};
use crate::tasks::{CreateTask, TaskLedger};

/// Point-in-time view of one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub name: String,
    pub task_name: String,
    pub schedule_type: ScheduleType,
    pub enabled: bool,
    /// Registered with the engine's periodic facility
    pub registered: bool,
    /// Task submitted by a Once/Delayed schedule
    pub task_id: Option<String>,
    pub last_submitted: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub config: ScheduleConfig,
}

struct ScheduleEntry {
    config: ScheduleConfig,
    registered: bool,
    task_id: Option<String>,
    last_submitted: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    fn status(&self) -> ScheduleStatus {
        ScheduleStatus {
            name: self.config.name.clone(),
            task_name: self.config.task_name.clone(),
            schedule_type: self.config.schedule_type,
            enabled: self.config.enabled,
            registered: self.registered,
            task_id: self.task_id.clone(),
            last_submitted: self.last_submitted,
            created_at: self.created_at,
            config: self.config.clone(),
        }
    }
}

/// What an activation produced.
enum Activation {
    Submitted(String),
    Registered,
}

pub struct Scheduler {
    ledger: Arc<TaskLedger>,
    schedules: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    pub fn new(ledger: Arc<TaskLedger>) -> Self {
        Self {
            ledger,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    fn schedules(&self) -> MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.schedules.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Validate and add a schedule, activating it when enabled.
    ///
    /// Returns `Ok(false)` when a schedule with the same name already exists.
    pub async fn add(&self, config: ScheduleConfig) -> Result<bool> {
        config.validate()?;
        if self.ledger.definition(&config.task_name).is_none() {
            return Err(OrchestratorError::UnknownTaskType(config.task_name.clone()));
        }

        let name = config.name.clone();
        {
            let mut schedules = self.schedules();
            if schedules.contains_key(&name) {
                debug!(schedule = %name, "Schedule already exists");
                return Ok(false);
            }
            schedules.insert(
                name.clone(),
                ScheduleEntry {
                    config: config.clone(),
                    registered: false,
                    task_id: None,
                    last_submitted: None,
                    created_at: Utc::now(),
                },
            );
        }

        if config.enabled {
            match self.activate(&config).await {
                Ok(activation) => self.record_activation(&name, activation),
                Err(e) => {
                    self.schedules().remove(&name);
                    warn!(schedule = %name, error = %e, "Schedule activation failed");
                    return Err(e);
                }
            }
        }

        info!(
            schedule = %name,
            task_name = %config.task_name,
            schedule_type = ?config.schedule_type,
            enabled = config.enabled,
            "Schedule added"
        );
        Ok(true)
    }

    /// Remove a schedule, unregistering it or cancelling its pending task.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let Some(entry) = self.schedules().remove(name) else {
            return Ok(false);
        };
        self.deactivate(&entry.config, entry.registered, entry.task_id.as_deref())
            .await?;
        info!(schedule = %name, "Schedule removed");
        Ok(true)
    }

    /// Enable a schedule. A Once/Delayed schedule that never submitted submits now.
    pub async fn enable(&self, name: &str) -> Result<bool> {
        let config = {
            let mut schedules = self.schedules();
            let Some(entry) = schedules.get_mut(name) else {
                return Ok(false);
            };
            if entry.config.enabled {
                return Ok(true);
            }
            entry.config.enabled = true;
            let needs_activation = entry.config.schedule_type.is_periodic() || entry.task_id.is_none();
            needs_activation.then(|| entry.config.clone())
        };

        if let Some(config) = config {
            match self.activate(&config).await {
                Ok(activation) => self.record_activation(name, activation),
                Err(e) => {
                    if let Some(entry) = self.schedules().get_mut(name) {
                        entry.config.enabled = false;
                    }
                    return Err(e);
                }
            }
        }

        info!(schedule = %name, "Schedule enabled");
        Ok(true)
    }

    /// Disable a schedule. The definition stays listed.
    pub async fn disable(&self, name: &str) -> Result<bool> {
        let (config, registered, task_id) = {
            let mut schedules = self.schedules();
            let Some(entry) = schedules.get_mut(name) else {
                return Ok(false);
            };
            if !entry.config.enabled {
                return Ok(true);
            }
            entry.config.enabled = false;
            let registered = std::mem::take(&mut entry.registered);
            (entry.config.clone(), registered, entry.task_id.clone())
        };

        self.deactivate(&config, registered, task_id.as_deref())
            .await?;
        info!(schedule = %name, "Schedule disabled");
        Ok(true)
    }

    async fn activate(&self, config: &ScheduleConfig) -> Result<Activation> {
        if let Some(trigger) = config.trigger() {
            let queue = config
                .queue
                .clone()
                .or_else(|| {
                    self.ledger
                        .definition(&config.task_name)
                        .and_then(|definition| definition.default_queue)
                })
                .unwrap_or_else(|| self.ledger.default_queue().to_string());

            self.ledger
                .engine()
                .register_periodic(PeriodicSpec {
                    name: config.name.clone(),
                    task_name: config.task_name.clone(),
                    args: config.args.clone(),
                    kwargs: config.kwargs_map(),
                    queue,
                    priority: config.priority,
                    trigger,
                })
                .await?;
            return Ok(Activation::Registered);
        }

        let now = Utc::now();
        let countdown = config.countdown(now);
        let mut request = CreateTask::builder()
            .task_name(config.task_name.clone())
            .args(config.args.clone())
            .kwargs(config.kwargs.clone())
            .priority(config.priority)
            .countdown(countdown)
            .tags(config.metadata.tags.clone())
            .schedule(config.name.clone())
            .build();
        request.queue = config.queue.clone();
        request.batch = config.metadata.batch_tag();
        request.retry_policy = config.retry_policy();
        request.expires = config
            .timeout_seconds
            .and_then(|timeout| chrono::Duration::from_std(countdown + Duration::from_secs(timeout)).ok())
            .map(|window| now + window);

        let task_id = self.ledger.create(request).await?;
        Ok(Activation::Submitted(task_id))
    }

    fn record_activation(&self, name: &str, activation: Activation) {
        let mut schedules = self.schedules();
        let Some(entry) = schedules.get_mut(name) else {
            return;
        };
        match activation {
            Activation::Registered => entry.registered = true,
            Activation::Submitted(task_id) => {
                debug!(schedule = %name, task_id = %task_id, "Schedule submitted task");
                entry.task_id = Some(task_id);
                entry.last_submitted = Some(Utc::now());
            }
        }
    }

    async fn deactivate(
        &self,
        config: &ScheduleConfig,
        registered: bool,
        task_id: Option<&str>,
    ) -> Result<()> {
        if config.schedule_type.is_periodic() {
            if registered && !self.ledger.engine().unregister_periodic(&config.name).await? {
                warn!(schedule = %config.name, "Periodic schedule was not registered with the engine");
            }
            return Ok(());
        }

        let Some(task_id) = task_id else {
            return Ok(());
        };
        match self.ledger.cancel(task_id, false).await {
            Ok(true) => info!(schedule = %config.name, task_id = %task_id, "Pending task cancelled"),
            Ok(false) => debug!(schedule = %config.name, task_id = %task_id, "Task already started or finished"),
            Err(e) if e.is_not_found() => {
                debug!(schedule = %config.name, task_id = %task_id, "Task no longer known to the engine")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, name: &str) -> Option<ScheduleStatus> {
        self.schedules().get(name).map(ScheduleEntry::status)
    }

    /// Every schedule, enabled or not, ordered by name.
    pub fn list(&self) -> Vec<ScheduleStatus> {
        let mut statuses: Vec<_> = self.schedules().values().map(ScheduleEntry::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Split `items` into Delayed schedules of `batch_size` items, each
    /// starting `delay_between_batches` after the previous one.
    ///
    /// Schedules are named `{name}_batch_{index}` and share a batch id. If any
    /// slice cannot be added the ones already added are removed.
    pub async fn create_batch_schedule(
        &self,
        base: ScheduleConfig,
        items: Vec<Value>,
        batch_size: usize,
        delay_between_batches: Duration,
    ) -> Result<String> {
        if batch_size == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "batch_size must be positive".into(),
            ));
        }
        if items.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "batch schedule needs at least one item".into(),
            ));
        }
        let delay = chrono::Duration::from_std(delay_between_batches).map_err(|_| {
            OrchestratorError::InvalidArgument("delay_between_batches is out of range".into())
        })?;

        let batch_id = Uuid::new_v4().to_string();
        let batch_total = items.len().div_ceil(batch_size);
        let first_start = base.start_time.unwrap_or_else(Utc::now);
        let mut added: Vec<String> = Vec::with_capacity(batch_total);

        for (index, slice) in items.chunks(batch_size).enumerate() {
            let mut config = base.clone();
            config.name = format!("{}_batch_{index}", base.name);
            config.schedule_type = ScheduleType::Delayed;
            config.start_time = Some(first_start + delay * index as i32);
            let mut kwargs = base.kwargs_map();
            kwargs.insert("items".into(), Value::Array(slice.to_vec()));
            config.kwargs = Value::Object(kwargs);
            config.metadata.batch_id = Some(batch_id.clone());
            config.metadata.batch_index = Some(index);
            config.metadata.batch_total = Some(batch_total);

            let result = match self.add(config.clone()).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(OrchestratorError::InvalidSchedule {
                    name: config.name.clone(),
                    reason: "a schedule with this name already exists".into(),
                }),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(batch_id = %batch_id, index, error = %e, "Batch schedule failed, rolling back");
                for name in &added {
                    if let Err(remove_error) = self.remove(name).await {
                        warn!(schedule = %name, error = %remove_error, "Failed to roll back batch member");
                    }
                }
                return Err(e);
            }
            added.push(config.name);
        }

        info!(
            batch_id = %batch_id,
            batch_total,
            delay_secs = delay_between_batches.as_secs(),
            "Batch schedule created"
        );
        Ok(batch_id)
    }

    /// Names of the schedules in a batch, by index.
    pub fn batch_members(&self, batch_id: &str) -> Vec<String> {
        let schedules = self.schedules();
        let mut members: Vec<(usize, String)> = schedules
            .values()
            .filter(|entry| entry.config.metadata.batch_id.as_deref() == Some(batch_id))
            .map(|entry| {
                (
                    entry.config.metadata.batch_index.unwrap_or(0),
                    entry.config.name.clone(),
                )
            })
            .collect();
        members.sort();
        members.into_iter().map(|(_, name)| name).collect()
    }

    /// Disable every member of a batch, cancelling pending slices.
    pub async fn disable_batch(&self, batch_id: &str) -> Result<usize> {
        let mut disabled = 0;
        for name in self.batch_members(batch_id) {
            if self.disable(&name).await? {
                disabled += 1;
            }
        }
        Ok(disabled)
    }

    /// Remove every member of a batch, cancelling pending slices.
    pub async fn remove_batch(&self, batch_id: &str) -> Result<usize> {
        let mut removed = 0;
        for name in self.batch_members(batch_id) {
            if self.remove(&name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
