//! JSON snapshot of the whole orchestration layer.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::monitor::{ProgressSummary, SystemHealth};
use crate::recovery::RecoveryStatistics;
use crate::resume::ResumeContext;
use crate::scheduler::ScheduleStatus;
use crate::tasks::TaskStatistics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemReport {
    pub generated_at: DateTime<Utc>,
    /// Latest health snapshot, if the status monitor has ticked
    pub health: Option<SystemHealth>,
    /// `None` when the engine could not be reached
    pub task_statistics: Option<TaskStatistics>,
    pub recovery: RecoveryStatistics,
    pub schedules: Vec<ScheduleStatus>,
    pub progress: Vec<ProgressSummary>,
    pub resume_contexts: Vec<ResumeContext>,
    pub tasks_with_checkpoints: Vec<String>,
    /// Problems hit while assembling the report
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SystemReport {
    /// Write the report as pretty JSON, atomically.
    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
