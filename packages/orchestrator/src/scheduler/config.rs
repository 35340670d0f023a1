use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use typed_builder::TypedBuilder;

use super::cron::CronExpression;
use crate::engine::{EngineRetryPolicy, PeriodicTrigger};
use crate::error::{OrchestratorError, Result};
use crate::tasks::{BatchTag, TaskPriority};

/// Spacing of engine-level retries requested through `max_retries`.
pub const ENGINE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Submitted once, as soon as the schedule is enabled
    Once,
    /// Every `interval_seconds`
    Interval,
    /// On a five-field cron expression
    Cron,
    /// Submitted once with a countdown to `start_time`
    Delayed,
}

impl ScheduleType {
    pub fn is_periodic(&self) -> bool {
        matches!(self, ScheduleType::Interval | ScheduleType::Cron)
    }
}

/// Grouping for schedules generated by a batch fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_total: Option<usize>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ScheduleMetadata {
    pub fn batch_tag(&self) -> Option<BatchTag> {
        Some(BatchTag {
            batch_id: self.batch_id.clone()?,
            batch_index: self.batch_index.unwrap_or(0),
            batch_total: self.batch_total.unwrap_or(1),
        })
    }
}

/// Declarative recipe for producing tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleConfig {
    pub name: String,
    pub task_name: String,
    pub schedule_type: ScheduleType,

    #[builder(default)]
    #[serde(default)]
    pub args: Vec<Value>,
    #[builder(default = Value::Null)]
    #[serde(default)]
    pub kwargs: Value,
    #[builder(default)]
    #[serde(default)]
    pub priority: TaskPriority,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub queue: Option<String>,
    #[builder(default = true)]
    pub enabled: bool,

    /// Engine-level retries before the failure reaches recovery
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// A task not started within this long after its due time is dropped
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub cron_expression: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub metadata: ScheduleMetadata,
}

impl ScheduleConfig {
    /// Reject configurations that cannot be carried out. Nothing is corrected.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| OrchestratorError::InvalidSchedule {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.task_name.trim().is_empty() {
            return Err(invalid("task_name must not be empty".into()));
        }
        if !matches!(self.kwargs, Value::Null | Value::Object(_)) {
            return Err(invalid("kwargs must be an object".into()));
        }
        if self.timeout_seconds == Some(0) {
            return Err(invalid("timeout_seconds must be positive".into()));
        }

        match self.schedule_type {
            ScheduleType::Once => {}
            ScheduleType::Interval => match self.interval_seconds {
                Some(seconds) if seconds > 0 => {}
                Some(_) => return Err(invalid("interval_seconds must be positive".into())),
                None => return Err(invalid("interval schedule requires interval_seconds".into())),
            },
            ScheduleType::Cron => {
                let expression = self
                    .cron_expression
                    .as_deref()
                    .ok_or_else(|| invalid("cron schedule requires cron_expression".into()))?;
                CronExpression::parse(expression).map_err(invalid)?;
            }
            ScheduleType::Delayed => {
                if self.start_time.is_none() {
                    return Err(invalid("delayed schedule requires start_time".into()));
                }
            }
        }
        Ok(())
    }

    /// kwargs as a map; validated configs always hold an object or null.
    pub(crate) fn kwargs_map(&self) -> Map<String, Value> {
        match &self.kwargs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Countdown until the one-shot submission is due, clamped to zero.
    pub(crate) fn countdown(&self, now: DateTime<Utc>) -> Duration {
        match (self.schedule_type, self.start_time) {
            (ScheduleType::Delayed, Some(start)) => (start - now).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn retry_policy(&self) -> Option<EngineRetryPolicy> {
        self.max_retries.map(|max_retries| EngineRetryPolicy {
            max_retries,
            interval: ENGINE_RETRY_INTERVAL,
        })
    }

    /// Periodic trigger for Interval and Cron schedules.
    pub(crate) fn trigger(&self) -> Option<PeriodicTrigger> {
        match self.schedule_type {
            ScheduleType::Interval => self
                .interval_seconds
                .map(|seconds| PeriodicTrigger::Interval(Duration::from_secs(seconds))),
            ScheduleType::Cron => self.cron_expression.clone().map(PeriodicTrigger::Cron),
            ScheduleType::Once | ScheduleType::Delayed => None,
        }
    }
}
