//! Resume coordination: successor tasks created from checkpoints.
//!
//! A predecessor has at most one live successor, whether it came from a
//! resume here or from a retry. The contexts map is only locked for
//! bookkeeping; submissions happen outside it, with the predecessor marked
//! in-flight so a concurrent resume or retry backs off instead of submitting
//! a second successor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, ProgressData};
use crate::error::{OrchestratorError, Result};
use crate::tasks::{CreateTask, ResumeMarker, Task, TaskLedger, TaskStatus};

/// kwargs seeded into a resumed successor.
pub const RESUME_STATE_KEY: &str = "resume_state";
pub const CHECKPOINT_ID_KEY: &str = "checkpoint_id";
pub const ORIGINAL_TASK_ID_KEY: &str = "original_task_id";

/// Checkpointed progress at or above this resumes.
const RESUME_THRESHOLD: f64 = 50.0;
/// Checkpointed progress below this restarts.
const RESTART_THRESHOLD: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    #[default]
    Auto,
    ResumeFromCheckpoint,
    Restart,
}

/// Resume or restart for a checkpoint at `percent` progress.
///
/// Between the two thresholds the task type's own convention decides.
pub fn recommend(percent: f64, prefers_resume: bool) -> ResumeStrategy {
    if percent >= RESUME_THRESHOLD {
        ResumeStrategy::ResumeFromCheckpoint
    } else if percent < RESTART_THRESHOLD {
        ResumeStrategy::Restart
    } else if prefers_resume {
        ResumeStrategy::ResumeFromCheckpoint
    } else {
        ResumeStrategy::Restart
    }
}

/// Links a successor to the task it continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    pub original_task_id: String,
    pub successor_task_id: String,
    pub task_name: String,
    pub checkpoint_id: Option<String>,
    pub resume_data: Value,
    pub progress_data: Option<ProgressData>,
    pub resume_timestamp: DateTime<Utc>,
    pub strategy: ResumeStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeOption {
    pub checkpoint_id: String,
    /// Task that wrote the checkpoint (the failed task or one of its predecessors)
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub progress: ProgressData,
    pub recommended_strategy: ResumeStrategy,
    /// Projected seconds of work left under the recommended strategy
    pub estimated_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeResult {
    pub original_task_id: String,
    pub successor_task_id: String,
    /// Strategy actually applied, never `Auto`
    pub strategy: ResumeStrategy,
    pub checkpoint_id: Option<String>,
    pub progress: Option<ProgressData>,
    /// False when an existing live successor was returned
    pub created: bool,
}

#[derive(Default)]
struct Contexts {
    by_successor: HashMap<String, ResumeContext>,
    by_predecessor: HashMap<String, String>,
    in_flight: HashSet<String>,
}

/// Removes the in-flight mark however the submission ends.
pub(crate) struct InFlight<'a> {
    contexts: &'a Mutex<Contexts>,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
            .remove(&self.task_id);
    }
}

pub struct ResumeCoordinator {
    ledger: Arc<TaskLedger>,
    checkpoints: Arc<CheckpointStore>,
    contexts: Mutex<Contexts>,
}

impl ResumeCoordinator {
    pub fn new(ledger: Arc<TaskLedger>, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            ledger,
            checkpoints,
            contexts: Mutex::new(Contexts::default()),
        }
    }

    fn contexts(&self) -> MutexGuard<'_, Contexts> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The task and its predecessors, nearest first.
    fn lineage(&self, task_id: &str) -> Vec<String> {
        let mut ids = vec![task_id.to_string()];
        ids.extend(self.ledger.predecessors(task_id));
        ids
    }

    /// Newest valid checkpoint of the task or, failing that, of its predecessors.
    pub async fn find_checkpoint(&self, task_id: &str) -> Option<Checkpoint> {
        for id in self.lineage(task_id) {
            if let Some(checkpoint) = self.checkpoints.latest(&id).await {
                return Some(checkpoint);
            }
        }
        None
    }

    /// True when a checkpoint exists and the task failed or was revoked.
    pub async fn can_resume(&self, task_id: &str) -> Result<bool> {
        let task = self.ledger.status(task_id).await?;
        if !is_resumable(task.status) {
            return Ok(false);
        }
        Ok(self.find_checkpoint(task_id).await.is_some())
    }

    /// Every checkpoint the task could resume from, newest first.
    pub async fn resume_options(&self, task_id: &str) -> Result<Vec<ResumeOption>> {
        let task = self.ledger.status(task_id).await?;
        let prefers_resume = self.prefers_resume(&task.task_name);
        let started = task.started_at.unwrap_or(task.created_at);

        let mut checkpoints = Vec::new();
        for id in self.lineage(task_id) {
            checkpoints.extend(self.checkpoints.list(&id).await);
        }
        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(checkpoints
            .into_iter()
            .map(|checkpoint| {
                let recommended_strategy = recommend(checkpoint.percent(), prefers_resume);
                let estimated_seconds =
                    estimate_seconds(&checkpoint, started, recommended_strategy);
                ResumeOption {
                    checkpoint_id: checkpoint.checkpoint_id,
                    task_id: checkpoint.task_id,
                    timestamp: checkpoint.timestamp,
                    progress: checkpoint.progress_data,
                    recommended_strategy,
                    estimated_seconds,
                }
            })
            .collect())
    }

    /// Create a successor for a failed or revoked task.
    ///
    /// Returns the existing successor when one is still live.
    pub async fn resume(
        &self,
        task_id: &str,
        checkpoint_id: Option<&str>,
        strategy: ResumeStrategy,
        force_restart: bool,
    ) -> Result<ResumeResult> {
        let task = self.ledger.status(task_id).await?;
        if !is_resumable(task.status) {
            return Err(OrchestratorError::NotResumable {
                task_id: task_id.to_string(),
                reason: format!("task is {}", task.status),
            });
        }

        let seen = self.successor_of(task_id);
        if let Some(existing) = self.live_successor(task_id).await {
            info!(
                task_id = %task_id,
                successor_task_id = %existing.successor_task_id,
                "Task already has a live successor"
            );
            return Ok(existing_result(task_id, existing));
        }

        let _in_flight = self.reserve(task_id)?;
        // Another resume may have finished between the check and the reservation
        if self.successor_of(task_id) != seen {
            if let Some(existing) = self
                .successor_of(task_id)
                .and_then(|successor| self.context_for(&successor))
            {
                return Ok(existing_result(task_id, existing));
            }
        }

        if let Some(successor_task_id) = self.live_successor_id(task_id).await {
            return Err(OrchestratorError::SuccessorLive {
                task_id: task_id.to_string(),
                successor_task_id,
            });
        }

        let checkpoint = match checkpoint_id {
            Some(id) => {
                let lineage = self.lineage(task_id);
                match self.checkpoints.load(id).await {
                    Some(checkpoint) if lineage.contains(&checkpoint.task_id) => Some(checkpoint),
                    _ => {
                        return Err(OrchestratorError::CheckpointNotFound {
                            checkpoint_id: id.to_string(),
                        })
                    }
                }
            }
            None if force_restart => None,
            None => self.find_checkpoint(task_id).await,
        };

        let applied = if force_restart {
            ResumeStrategy::Restart
        } else {
            match (strategy, &checkpoint) {
                (ResumeStrategy::Restart, _) => ResumeStrategy::Restart,
                (ResumeStrategy::ResumeFromCheckpoint, Some(_)) => {
                    ResumeStrategy::ResumeFromCheckpoint
                }
                (ResumeStrategy::ResumeFromCheckpoint, None) => {
                    return Err(OrchestratorError::NotResumable {
                        task_id: task_id.to_string(),
                        reason: "no valid checkpoint to resume from".into(),
                    })
                }
                (ResumeStrategy::Auto, Some(checkpoint)) => {
                    recommend(checkpoint.percent(), self.prefers_resume(&task.task_name))
                }
                (ResumeStrategy::Auto, None) => ResumeStrategy::Restart,
            }
        };

        let context = match applied {
            ResumeStrategy::ResumeFromCheckpoint => match &checkpoint {
                Some(checkpoint) => self.submit_resume(&task, checkpoint).await?,
                None => {
                    return Err(OrchestratorError::NotResumable {
                        task_id: task_id.to_string(),
                        reason: "no valid checkpoint to resume from".into(),
                    })
                }
            },
            _ => self.submit_restart(&task).await?,
        };

        let result = ResumeResult {
            original_task_id: task_id.to_string(),
            successor_task_id: context.successor_task_id.clone(),
            strategy: context.strategy,
            checkpoint_id: context.checkpoint_id.clone(),
            progress: context.progress_data.clone(),
            created: true,
        };

        {
            let mut contexts = self.contexts();
            contexts
                .by_predecessor
                .insert(task_id.to_string(), context.successor_task_id.clone());
            contexts
                .by_successor
                .insert(context.successor_task_id.clone(), context);
        }

        info!(
            task_id = %task_id,
            successor_task_id = %result.successor_task_id,
            strategy = ?result.strategy,
            checkpoint_id = ?result.checkpoint_id,
            "Successor task submitted"
        );
        Ok(result)
    }

    async fn submit_resume(&self, task: &Task, checkpoint: &Checkpoint) -> Result<ResumeContext> {
        let mut kwargs = original_kwargs(&task.metadata.kwargs);
        kwargs.insert(RESUME_STATE_KEY.into(), checkpoint.state_data.clone());
        kwargs.insert(
            CHECKPOINT_ID_KEY.into(),
            Value::String(checkpoint.checkpoint_id.clone()),
        );
        kwargs.insert(
            ORIGINAL_TASK_ID_KEY.into(),
            Value::String(task.task_id.clone()),
        );

        let successor_task_id = self
            .ledger
            .create(self.successor_request(
                task,
                kwargs,
                ResumeMarker {
                    original_task_id: task.task_id.clone(),
                    checkpoint_id: Some(checkpoint.checkpoint_id.clone()),
                },
            ))
            .await?;

        Ok(ResumeContext {
            original_task_id: task.task_id.clone(),
            successor_task_id,
            task_name: task.task_name.clone(),
            checkpoint_id: Some(checkpoint.checkpoint_id.clone()),
            resume_data: checkpoint.state_data.clone(),
            progress_data: Some(checkpoint.progress_data.clone()),
            resume_timestamp: Utc::now(),
            strategy: ResumeStrategy::ResumeFromCheckpoint,
        })
    }

    async fn submit_restart(&self, task: &Task) -> Result<ResumeContext> {
        let mut cleared = 0;
        for id in self.lineage(&task.task_id) {
            cleared += self.checkpoints.clear(&id).await?;
        }

        let successor_task_id = self
            .ledger
            .create(self.successor_request(
                task,
                original_kwargs(&task.metadata.kwargs),
                ResumeMarker {
                    original_task_id: task.task_id.clone(),
                    checkpoint_id: None,
                },
            ))
            .await?;

        info!(task_id = %task.task_id, cleared, "Restarting task from scratch");
        Ok(ResumeContext {
            original_task_id: task.task_id.clone(),
            successor_task_id,
            task_name: task.task_name.clone(),
            checkpoint_id: None,
            resume_data: Value::Null,
            progress_data: None,
            resume_timestamp: Utc::now(),
            strategy: ResumeStrategy::Restart,
        })
    }

    fn successor_request(
        &self,
        task: &Task,
        kwargs: Map<String, Value>,
        marker: ResumeMarker,
    ) -> CreateTask {
        let mut request = CreateTask::builder()
            .task_name(task.task_name.clone())
            .args(task.metadata.args.clone())
            .kwargs(Value::Object(kwargs))
            .priority(task.priority)
            .queue(task.metadata.queue.clone())
            .tags(task.metadata.tags.clone())
            .resumed_from(marker)
            .root_task_id(task.root_task_id.clone())
            .build();
        request.batch = task.metadata.batch.clone();
        request.schedule = task.metadata.schedule.clone();
        request
    }

    /// Existing successor that has not reached a terminal status.
    async fn live_successor(&self, task_id: &str) -> Option<ResumeContext> {
        let context = {
            let contexts = self.contexts();
            let successor = contexts.by_predecessor.get(task_id)?;
            contexts.by_successor.get(successor).cloned()
        }?;

        match self.ledger.status(&context.successor_task_id).await {
            Ok(successor) if !successor.is_terminal() => Some(context),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    successor_task_id = %context.successor_task_id,
                    error = %e,
                    "Could not check successor status"
                );
                None
            }
        }
    }

    /// Any retry or resume of `task_id` that has not reached a terminal status.
    pub(crate) async fn live_successor_id(&self, task_id: &str) -> Option<String> {
        for successor in self.ledger.successors(task_id) {
            if successor.is_terminal() {
                continue;
            }
            match self.ledger.status(&successor.task_id).await {
                Ok(task) if !task.is_terminal() => return Some(task.task_id),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        successor_task_id = %successor.task_id,
                        error = %e,
                        "Could not check successor status, treating it as live"
                    );
                    return Some(successor.task_id);
                }
            }
        }
        None
    }

    /// Reserve `task_id` for a successor submitted outside the coordinator.
    ///
    /// Fails while another submission is in flight or a successor is live.
    pub(crate) async fn claim_successor(&self, task_id: &str) -> Result<InFlight<'_>> {
        let slot = self.reserve(task_id)?;
        if let Some(successor_task_id) = self.live_successor_id(task_id).await {
            return Err(OrchestratorError::SuccessorLive {
                task_id: task_id.to_string(),
                successor_task_id,
            });
        }
        Ok(slot)
    }

    fn reserve(&self, task_id: &str) -> Result<InFlight<'_>> {
        let mut contexts = self.contexts();
        if !contexts.in_flight.insert(task_id.to_string()) {
            return Err(OrchestratorError::RemediationInProgress {
                task_id: task_id.to_string(),
            });
        }
        Ok(InFlight {
            contexts: &self.contexts,
            task_id: task_id.to_string(),
        })
    }

    fn prefers_resume(&self, task_name: &str) -> bool {
        self.ledger
            .definition(task_name)
            .map_or(true, |definition| definition.prefers_resume)
    }

    // ------------------------------------------------------------------------
    // Queries and housekeeping
    // ------------------------------------------------------------------------

    pub fn context_for(&self, successor_task_id: &str) -> Option<ResumeContext> {
        self.contexts()
            .by_successor
            .get(successor_task_id)
            .cloned()
    }

    pub fn successor_of(&self, task_id: &str) -> Option<String> {
        self.contexts().by_predecessor.get(task_id).cloned()
    }

    pub fn contexts_snapshot(&self) -> Vec<ResumeContext> {
        let mut contexts: Vec<_> = self.contexts().by_successor.values().cloned().collect();
        contexts.sort_by(|a, b| a.resume_timestamp.cmp(&b.resume_timestamp));
        contexts
    }

    /// Drop contexts whose successor finished (or is unknown to the engine).
    pub async fn cleanup_contexts(&self) -> usize {
        let successors: Vec<String> = self.contexts().by_successor.keys().cloned().collect();

        let mut finished = Vec::new();
        for successor in successors {
            match self.ledger.status(&successor).await {
                Ok(task) if task.is_terminal() => finished.push(successor),
                Ok(_) => {}
                Err(e) if e.is_not_found() => finished.push(successor),
                Err(e) => warn!(successor_task_id = %successor, error = %e, "Skipping context cleanup"),
            }
        }

        let mut contexts = self.contexts();
        for successor in &finished {
            if let Some(context) = contexts.by_successor.remove(successor) {
                if contexts.by_predecessor.get(&context.original_task_id) == Some(successor) {
                    contexts.by_predecessor.remove(&context.original_task_id);
                }
            }
        }
        if !finished.is_empty() {
            info!(count = finished.len(), "Reclaimed resume contexts");
        }
        finished.len()
    }

    /// Everything known about resuming one task, as JSON for export.
    pub async fn resume_report(&self, task_id: &str) -> Result<Value> {
        let task = self.ledger.status(task_id).await?;
        let options = self.resume_options(task_id).await?;
        let can_resume = is_resumable(task.status) && !options.is_empty();

        Ok(json!({
            "task": task,
            "can_resume": can_resume,
            "options": options,
            "successor": self.successor_of(task_id).and_then(|id| self.context_for(&id)),
            "resumed_from": self.context_for(task_id),
            "generated_at": Utc::now(),
        }))
    }
}

fn existing_result(task_id: &str, existing: ResumeContext) -> ResumeResult {
    ResumeResult {
        original_task_id: task_id.to_string(),
        successor_task_id: existing.successor_task_id,
        strategy: existing.strategy,
        checkpoint_id: existing.checkpoint_id,
        progress: existing.progress_data,
        created: false,
    }
}

pub(crate) fn is_resumable(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Failure | TaskStatus::Revoked)
}

/// kwargs without the markers a previous resume added.
fn original_kwargs(kwargs: &Map<String, Value>) -> Map<String, Value> {
    let mut kwargs = kwargs.clone();
    for key in [RESUME_STATE_KEY, CHECKPOINT_ID_KEY, ORIGINAL_TASK_ID_KEY] {
        kwargs.remove(key);
    }
    kwargs
}

/// Remaining seconds when resuming, full run length when restarting.
fn estimate_seconds(
    checkpoint: &Checkpoint,
    started: DateTime<Utc>,
    strategy: ResumeStrategy,
) -> Option<f64> {
    let percent = checkpoint.percent();
    if percent <= 0.0 {
        return None;
    }
    let elapsed = (checkpoint.timestamp - started).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return None;
    }
    let total = elapsed * 100.0 / percent;
    match strategy {
        ResumeStrategy::Restart => Some(total),
        _ => Some((total - elapsed).max(0.0)),
    }
}
