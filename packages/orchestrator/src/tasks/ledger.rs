//! Task ledger: creates, tracks and cancels tasks on the execution engine.
//!
//! The ledger keeps a status cache keyed by engine task id. Terminal entries
//! are authoritative; everything else is reconciled against the engine on
//! read (`status`) or in bulk (`refresh`). The cache lock is only held for
//! map reads and writes, never across an engine call.
//!
//! Every status change is reported by exactly one `refresh`, including
//! changes first seen by `status` and tasks the engine's periodic facility
//! submitted on its own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::model::{
    BatchTag, ResumeMarker, Task, TaskDefinition, TaskMetadata, TaskPriority, TaskResolution,
    TaskStatus, TaskTransition,
};
use crate::engine::{
    EngineRetryPolicy, EngineTaskState, ExecutionEngine, RevokeOutcome, SubmitRequest, WorkerStats,
};
use crate::error::{OrchestratorError, Result};

const DEFAULT_QUEUE: &str = "default";

// ============================================================================
// Requests
// ============================================================================

/// Everything needed to submit one task.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateTask {
    pub task_name: String,

    // Payload
    #[builder(default)]
    pub args: Vec<Value>,
    /// JSON object (or null for none)
    #[builder(default = Value::Null)]
    pub kwargs: Value,
    #[builder(default)]
    pub priority: TaskPriority,
    #[builder(default, setter(strip_option))]
    pub queue: Option<String>,

    // Timing
    #[builder(default, setter(strip_option))]
    pub eta: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub countdown: Option<Duration>,
    #[builder(default, setter(strip_option))]
    pub expires: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub retry_policy: Option<EngineRetryPolicy>,

    // Metadata
    #[builder(default)]
    pub tags: BTreeMap<String, String>,
    #[builder(default, setter(strip_option))]
    pub batch: Option<BatchTag>,
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,
    #[builder(default, setter(strip_option))]
    pub resumed_from: Option<ResumeMarker>,
    #[builder(default, setter(strip_option))]
    pub retry_of: Option<String>,
    #[builder(default, setter(strip_option))]
    pub root_task_id: Option<String>,
}

/// Aggregate view over the ledger and the engine's workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub status_counts: HashMap<TaskStatus, usize>,
    pub priority_counts: HashMap<TaskPriority, usize>,
    /// Success share of tasks completed inside the statistics window
    pub recent_success_rate: f64,
    pub recent_error_rate: f64,
    pub recent_completed: usize,
    pub avg_runtime_secs: Option<f64>,
    pub avg_wait_secs: Option<f64>,
    pub failed_by_queue: HashMap<String, usize>,
    pub worker_stats: Vec<WorkerStats>,
    /// Submissions per schedule name, from the ledger and the engine's periodic facility
    pub schedule_submissions: HashMap<String, u64>,
}

// ============================================================================
// Ledger
// ============================================================================

pub struct TaskLedger {
    engine: Arc<dyn ExecutionEngine>,
    tasks: Mutex<HashMap<String, Task>>,
    definitions: RwLock<HashMap<String, TaskDefinition>>,
    schedule_submissions: Mutex<HashMap<String, u64>>,
    /// Transitions applied by `status` and not yet returned from `refresh`
    unreported: Mutex<Vec<TaskTransition>>,
    /// Periodic task ids taken from the engine but not yet cached
    unadopted: Mutex<Vec<String>>,
    default_queue: String,
    stats_window: chrono::Duration,
}

impl TaskLedger {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            tasks: Mutex::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            schedule_submissions: Mutex::new(HashMap::new()),
            unreported: Mutex::new(Vec::new()),
            unadopted: Mutex::new(Vec::new()),
            default_queue: DEFAULT_QUEUE.to_string(),
            stats_window: chrono::Duration::hours(1),
        }
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Window used for `recent_success_rate` and `recent_error_rate`.
    pub fn with_stats_window(mut self, window: chrono::Duration) -> Self {
        self.stats_window = window;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    /// Queue used when neither the request nor the task type names one.
    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Task definitions
    // ------------------------------------------------------------------------

    pub fn register(&self, definition: TaskDefinition) {
        debug!(task_name = %definition.name, "Registered task definition");
        self.definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.name.clone(), definition);
    }

    pub fn definition(&self, task_name: &str) -> Option<TaskDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_name)
            .cloned()
    }

    pub fn definitions(&self) -> Vec<TaskDefinition> {
        let mut definitions: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Validate and enqueue a task. Returns once the engine accepted it.
    pub async fn create(&self, request: CreateTask) -> Result<String> {
        let definition = self
            .definition(&request.task_name)
            .ok_or_else(|| OrchestratorError::UnknownTaskType(request.task_name.clone()))?;

        let kwargs = match request.kwargs {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(OrchestratorError::InvalidPayload {
                    task_name: request.task_name,
                    reason: format!("kwargs must be an object, got {}", json_kind(&other)),
                })
            }
        };

        let missing = definition.missing_kwargs(&kwargs);
        if !missing.is_empty() {
            return Err(OrchestratorError::InvalidPayload {
                task_name: request.task_name,
                reason: format!("missing required kwargs: {}", missing.join(", ")),
            });
        }

        let queue = request
            .queue
            .or(definition.default_queue)
            .unwrap_or_else(|| self.default_queue.clone());

        let submission = SubmitRequest {
            task_name: request.task_name.clone(),
            args: request.args.clone(),
            kwargs: kwargs.clone(),
            priority: request.priority,
            queue: queue.clone(),
            eta: request.eta,
            countdown: request.countdown,
            expires: request.expires,
            retry_policy: request.retry_policy,
        };

        let task_id = self.engine.submit(submission).await.map_err(|e| {
            warn!(task_name = %request.task_name, error = %e, "Engine rejected submission");
            e
        })?;

        let metadata = TaskMetadata {
            queue,
            args: request.args,
            kwargs,
            tags: request.tags,
            batch: request.batch,
            schedule: request.schedule,
            resumed_from: request.resumed_from,
            retry_of: request.retry_of,
        };

        let mut task = Task::new(
            task_id.clone(),
            request.task_name,
            request.priority,
            metadata,
            Utc::now(),
        );
        if let Some(root) = request.root_task_id {
            task = task.with_root(root);
        }

        if let Some(schedule) = &task.metadata.schedule {
            *self
                .schedule_submissions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(schedule.clone())
                .or_insert(0) += 1;
        }

        info!(
            task_id = %task_id,
            task_name = %task.task_name,
            queue = %task.metadata.queue,
            priority = ?task.priority,
            "Task submitted"
        );
        self.cache().insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Split `items` into slices of `batch_size` and submit one task per slice.
    ///
    /// Each task gets the slice under the `items` kwarg and a [`BatchTag`].
    /// If any submission fails, the ones already made are revoked.
    pub async fn batch_create(
        &self,
        template: CreateTask,
        items: Vec<Value>,
        batch_size: usize,
    ) -> Result<Vec<String>> {
        if batch_size == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "batch_size must be positive".into(),
            ));
        }

        let batch_id = Uuid::new_v4().to_string();
        let batch_total = items.len().div_ceil(batch_size);
        let mut created = Vec::with_capacity(batch_total);

        for (batch_index, slice) in items.chunks(batch_size).enumerate() {
            let mut request = template.clone();
            let mut kwargs = match request.kwargs {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            kwargs.insert("items".into(), Value::Array(slice.to_vec()));
            request.kwargs = Value::Object(kwargs);
            request.batch = Some(BatchTag {
                batch_id: batch_id.clone(),
                batch_index,
                batch_total,
            });

            match self.create(request).await {
                Ok(task_id) => created.push(task_id),
                Err(e) => {
                    warn!(
                        batch_id = %batch_id,
                        batch_index,
                        error = %e,
                        "Batch submission failed, revoking submitted slices"
                    );
                    for task_id in &created {
                        if let Err(cancel_error) = self.cancel(task_id, false).await {
                            warn!(task_id = %task_id, error = %cancel_error, "Failed to revoke batch slice");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(batch_id = %batch_id, batch_total, "Batch submitted");
        Ok(created)
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Current status. Terminal cache entries are returned as-is; anything
    /// else is reconciled with the engine first.
    pub async fn status(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.get(task_id) {
            if task.is_terminal() {
                return Ok(task);
            }
        }

        let Some(state) = self.engine.query(task_id).await? else {
            if self.cache().remove(task_id).is_some() {
                warn!(task_id = %task_id, "Engine no longer knows task, dropped from cache");
            }
            return Err(OrchestratorError::task_not_found(task_id));
        };

        let (task, transition) = {
            let mut cache = self.cache();
            let task = cache
                .entry(task_id.to_string())
                .or_insert_with(|| task_from_engine(task_id, &state));
            let transition = apply_state(task, &state, Utc::now());
            (task.clone(), transition)
        };
        if let Some(transition) = transition {
            lock(&self.unreported).push(transition);
        }
        Ok(task)
    }

    /// Reconcile the ledger with the engine and return every status change
    /// not reported before.
    ///
    /// Tasks fired by the engine's periodic facility are adopted into the
    /// cache first, so their failures are seen like any other.
    pub async fn refresh(&self) -> Result<Vec<TaskTransition>> {
        let mut transitions = std::mem::take(&mut *lock(&self.unreported));
        self.adopt_periodic(&mut transitions).await;

        let pending: Vec<String> = self
            .cache()
            .values()
            .filter(|task| !task.is_terminal())
            .map(|task| task.task_id.clone())
            .collect();

        for task_id in pending {
            let state = match self.engine.query(&task_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Status query failed during refresh");
                    continue;
                }
            };

            let mut cache = self.cache();
            match state {
                Some(state) => {
                    if let Some(task) = cache.get_mut(&task_id) {
                        if let Some(transition) = apply_state(task, &state, Utc::now()) {
                            transitions.push(transition);
                        }
                    }
                }
                None => {
                    cache.remove(&task_id);
                    warn!(task_id = %task_id, "Engine no longer knows task, dropped from cache");
                }
            }
        }

        if !transitions.is_empty() {
            debug!(count = transitions.len(), "Ledger refresh observed transitions");
        }
        Ok(transitions)
    }

    async fn adopt_periodic(&self, transitions: &mut Vec<TaskTransition>) {
        match self.engine.take_periodic_fired().await {
            Ok(fired) => lock(&self.unadopted).extend(fired),
            Err(e) => warn!(error = %e, "Could not collect periodic submissions"),
        }

        let waiting = std::mem::take(&mut *lock(&self.unadopted));
        let mut retry_later = Vec::new();
        for task_id in waiting {
            if self.cache().contains_key(&task_id) {
                continue;
            }
            let state = match self.engine.query(&task_id).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    warn!(task_id = %task_id, "Periodic task unknown to the engine, not adopted");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Status query failed while adopting periodic task");
                    retry_later.push(task_id);
                    continue;
                }
            };

            let mut cache = self.cache();
            let task = cache
                .entry(task_id.clone())
                .or_insert_with(|| task_from_engine(&task_id, &state));
            debug!(
                task_id = %task_id,
                schedule = ?task.metadata.schedule,
                "Adopted periodic task"
            );
            transitions.extend(apply_state(task, &state, Utc::now()));
        }
        lock(&self.unadopted).extend(retry_later);
    }

    /// Cached task without consulting the engine.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.cache().get(task_id).cloned()
    }

    /// Snapshot of every cached task, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.cache().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Tasks the engine reports as running, scheduled or reserved.
    pub async fn active_tasks(&self) -> Result<Vec<Task>> {
        let (active, scheduled, reserved) = futures::try_join!(
            self.engine.inspect_active(),
            self.engine.inspect_scheduled(),
            self.engine.inspect_reserved(),
        )?;

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for info in active.into_iter().chain(scheduled).chain(reserved) {
            if !seen.insert(info.task_id.clone()) {
                continue;
            }
            match self.status(&info.task_id).await {
                Ok(task) if !task.is_terminal() => tasks.push(task),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    // ------------------------------------------------------------------------
    // Cancellation and resolution
    // ------------------------------------------------------------------------

    /// Best-effort cancel. A started task is only interrupted with `terminate`.
    pub async fn cancel(&self, task_id: &str, terminate: bool) -> Result<bool> {
        match self.engine.revoke(task_id, terminate).await? {
            RevokeOutcome::Revoked => {
                if let Some(task) = self.cache().get_mut(task_id) {
                    task.transition(TaskStatus::Revoked, Utc::now());
                }
                info!(task_id = %task_id, terminate, "Task revoked");
                Ok(true)
            }
            RevokeOutcome::AlreadyRunning => {
                warn!(task_id = %task_id, "Task already running, revoke needs terminate");
                Ok(false)
            }
            RevokeOutcome::AlreadyFinished => Ok(false),
            RevokeOutcome::NotFound => Err(OrchestratorError::task_not_found(task_id)),
        }
    }

    /// Record why a task will not be remediated further.
    pub fn resolve(&self, task_id: &str, resolution: TaskResolution) -> Result<()> {
        let mut cache = self.cache();
        let task = cache
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
        task.resolution = Some(resolution);
        task.resolved_at = Some(Utc::now());
        info!(task_id = %task_id, resolution = ?resolution, "Task resolved");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lineage
    // ------------------------------------------------------------------------

    /// First task of the retry/resume chain `task_id` belongs to.
    pub fn lineage_root(&self, task_id: &str) -> Option<String> {
        self.cache()
            .get(task_id)
            .map(|task| task.root_task_id.clone())
    }

    /// Tasks created as a retry or resume of `task_id`, oldest first.
    pub fn successors(&self, task_id: &str) -> Vec<Task> {
        let mut successors: Vec<Task> = self
            .cache()
            .values()
            .filter(|task| task.metadata.predecessor() == Some(task_id))
            .cloned()
            .collect();
        successors.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        successors
    }

    /// Ancestors of `task_id`, nearest first.
    pub fn predecessors(&self, task_id: &str) -> Vec<String> {
        let cache = self.cache();
        let mut chain = Vec::new();
        let mut current = cache
            .get(task_id)
            .and_then(|task| task.metadata.predecessor().map(str::to_string));

        while let Some(id) = current {
            if id == task_id || chain.contains(&id) {
                break;
            }
            current = cache
                .get(&id)
                .and_then(|task| task.metadata.predecessor().map(str::to_string));
            chain.push(id);
        }
        chain
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Drop terminal tasks that completed more than `older_than` ago.
    pub fn purge_terminal(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|_, task| !task.completed_at.is_some_and(|done| done < cutoff));
        let purged = before - cache.len();
        if purged > 0 {
            info!(purged, "Purged terminal tasks");
        }
        purged
    }

    pub async fn statistics(&self) -> Result<TaskStatistics> {
        let worker_stats = self.engine.worker_stats().await?;
        let periodic_runs = self.engine.periodic_runs().await?;

        let mut stats = TaskStatistics {
            worker_stats,
            ..Default::default()
        };

        let cutoff = Utc::now() - self.stats_window;
        let mut recent_success = 0usize;
        let mut recent_failure = 0usize;
        let mut runtimes = Vec::new();
        let mut waits = Vec::new();

        {
            let cache = self.cache();
            stats.total = cache.len();
            for task in cache.values() {
                *stats.status_counts.entry(task.status).or_insert(0) += 1;
                *stats.priority_counts.entry(task.priority).or_insert(0) += 1;

                if task.status == TaskStatus::Failure {
                    *stats
                        .failed_by_queue
                        .entry(task.metadata.queue.clone())
                        .or_insert(0) += 1;
                }

                if task.completed_at.is_some_and(|done| done >= cutoff) {
                    match task.status {
                        TaskStatus::Success => recent_success += 1,
                        TaskStatus::Failure => recent_failure += 1,
                        _ => {}
                    }
                }

                runtimes.extend(task.runtime_secs());
                waits.extend(task.wait_secs());
            }
        }

        stats.recent_completed = recent_success + recent_failure;
        if stats.recent_completed > 0 {
            stats.recent_success_rate = recent_success as f64 / stats.recent_completed as f64;
            stats.recent_error_rate = recent_failure as f64 / stats.recent_completed as f64;
        }
        stats.avg_runtime_secs = mean(&runtimes);
        stats.avg_wait_secs = mean(&waits);

        stats.schedule_submissions = self
            .schedule_submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (name, runs) in periodic_runs {
            *stats.schedule_submissions.entry(name).or_insert(0) += runs;
        }

        Ok(stats)
    }
}

fn task_from_engine(task_id: &str, state: &EngineTaskState) -> Task {
    let metadata = TaskMetadata {
        queue: state.queue.clone(),
        args: state.args.clone(),
        kwargs: state.kwargs.clone(),
        schedule: state.origin.clone(),
        ..Default::default()
    };
    Task::new(
        task_id,
        state.task_name.clone(),
        state.priority,
        metadata,
        state.received_at,
    )
}

/// Fold engine state into a cached task, returning the status change if any.
fn apply_state(
    task: &mut Task,
    state: &EngineTaskState,
    now: DateTime<Utc>,
) -> Option<TaskTransition> {
    if task.is_terminal() {
        return None;
    }

    if state.progress.is_some() {
        task.progress = state.progress.clone();
    }
    if state.result.is_some() {
        task.result = state.result.clone();
    }
    if state.error.is_some() {
        task.error = state.error.clone();
    }

    let from = task.status;
    task.transition(state.status, now).then(|| TaskTransition {
        task_id: task.task_id.clone(),
        task_name: task.task_name.clone(),
        from,
        to: state.status,
        at: now,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, PeriodicSpec, PeriodicTrigger};
    use crate::error::{FailureKind, TaskError};
    use serde_json::json;

    fn ledger() -> (Arc<MemoryEngine>, TaskLedger) {
        let engine = Arc::new(MemoryEngine::new());
        let ledger = TaskLedger::new(engine.clone());
        ledger.register(TaskDefinition::new("crawl_site").require("url"));
        ledger.register(TaskDefinition::new("sync_source").queue("sync"));
        (engine, ledger)
    }

    fn crawl(url: &str) -> CreateTask {
        CreateTask::builder()
            .task_name("crawl_site")
            .kwargs(json!({ "url": url }))
            .build()
    }

    #[tokio::test]
    async fn create_rejects_unknown_task_type() {
        let (_, ledger) = ledger();
        let err = ledger
            .create(CreateTask::builder().task_name("nope").build())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTaskType(name) if name == "nope"));
    }

    #[tokio::test]
    async fn create_rejects_missing_kwargs_and_non_objects() {
        let (engine, ledger) = ledger();

        let missing = ledger
            .create(CreateTask::builder().task_name("crawl_site").build())
            .await
            .unwrap_err();
        assert!(matches!(missing, OrchestratorError::InvalidPayload { .. }));

        let not_object = ledger
            .create(
                CreateTask::builder()
                    .task_name("sync_source")
                    .kwargs(json!([1, 2]))
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(not_object.to_string().contains("array"));
        assert!(engine.submitted().is_empty());
    }

    #[tokio::test]
    async fn create_uses_definition_queue() {
        let (engine, ledger) = ledger();
        let id = ledger
            .create(CreateTask::builder().task_name("sync_source").build())
            .await
            .unwrap();
        assert_eq!(engine.submission(&id).unwrap().queue, "sync");
        assert_eq!(ledger.get(&id).unwrap().root_task_id, id);
    }

    #[tokio::test]
    async fn status_follows_engine_and_stays_terminal() {
        let (engine, ledger) = ledger();
        let id = ledger.create(crawl("https://example.org")).await.unwrap();

        engine.start(&id);
        let task = ledger.status(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert!(task.started_at.is_some());

        engine.fail(&id, TaskError::new(FailureKind::Timeout, "read timed out"));
        let task = ledger.status(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.error.unwrap().kind, FailureKind::Timeout);

        // Terminal entries are served from the cache even after the engine forgets them
        engine.forget(&id);
        assert_eq!(ledger.status(&id).await.unwrap().status, TaskStatus::Failure);
    }

    #[tokio::test]
    async fn engine_miss_is_not_found_not_stale() {
        let (engine, ledger) = ledger();
        let id = ledger.create(crawl("https://example.org")).await.unwrap();
        engine.forget(&id);

        let err = ledger.status(&id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(ledger.get(&id).is_none());
    }

    #[tokio::test]
    async fn cancel_needs_terminate_for_started_tasks() {
        let (engine, ledger) = ledger();
        let id = ledger.create(crawl("https://example.org")).await.unwrap();
        engine.start(&id);

        assert!(!ledger.cancel(&id, false).await.unwrap());
        assert!(ledger.cancel(&id, true).await.unwrap());
        assert_eq!(ledger.get(&id).unwrap().status, TaskStatus::Revoked);
        assert!(ledger.cancel("missing", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn batch_create_tags_each_slice() {
        let (engine, ledger) = ledger();
        let items: Vec<Value> = (0..7).map(Value::from).collect();
        let ids = ledger
            .batch_create(crawl("https://example.org"), items, 3)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let tags: Vec<BatchTag> = ids
            .iter()
            .map(|id| ledger.get(id).unwrap().metadata.batch.unwrap())
            .collect();
        assert!(tags.iter().all(|tag| tag.batch_total == 3 && tag.batch_id == tags[0].batch_id));
        assert_eq!(
            tags.iter().map(|tag| tag.batch_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let last = engine.submission(&ids[2]).unwrap();
        assert_eq!(last.kwargs["items"], json!([6]));
        assert_eq!(last.kwargs["url"], json!("https://example.org"));
    }

    #[tokio::test]
    async fn batch_create_rejects_zero_batch_size() {
        let (_, ledger) = ledger();
        let err = ledger
            .batch_create(crawl("https://example.org"), vec![json!(1)], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn refresh_reports_transitions_once() {
        let (engine, ledger) = ledger();
        let id = ledger.create(crawl("https://example.org")).await.unwrap();
        engine.succeed(&id, json!({"pages": 12}));

        let transitions = ledger.refresh().await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, TaskStatus::Success);
        assert!(ledger.refresh().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_seen_by_status_are_reported_on_refresh() {
        let (engine, ledger) = ledger();
        let id = ledger.create(crawl("https://example.org")).await.unwrap();
        engine.start(&id);
        engine.fail(&id, TaskError::new(FailureKind::Network, "down"));

        assert_eq!(ledger.status(&id).await.unwrap().status, TaskStatus::Failure);

        let transitions = ledger.refresh().await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].task_id, id);
        assert_eq!(transitions[0].to, TaskStatus::Failure);
        assert!(ledger.refresh().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_adopts_tasks_fired_by_periodic_schedules() {
        let (engine, ledger) = ledger();
        engine
            .register_periodic(PeriodicSpec {
                name: "hourly".into(),
                task_name: "sync_source".into(),
                args: vec![],
                kwargs: Default::default(),
                queue: "sync".into(),
                priority: TaskPriority::Normal,
                trigger: PeriodicTrigger::Interval(Duration::from_secs(3600)),
            })
            .await
            .unwrap();

        let quiet = engine.fire_periodic("hourly").unwrap();
        let failed = engine.fire_periodic("hourly").unwrap();
        engine.start(&failed);
        engine.fail(&failed, TaskError::new(FailureKind::Timeout, "slow"));

        let transitions = ledger.refresh().await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].task_id, failed);
        assert_eq!(transitions[0].from, TaskStatus::Pending);
        assert_eq!(transitions[0].to, TaskStatus::Failure);

        let adopted = ledger.get(&quiet).unwrap();
        assert_eq!(adopted.status, TaskStatus::Pending);
        assert_eq!(adopted.metadata.schedule.as_deref(), Some("hourly"));
        assert_eq!(ledger.statistics().await.unwrap().total, 2);
        assert!(ledger.refresh().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statistics_count_statuses_and_success_rate() {
        let (engine, ledger) = ledger();
        let ok = ledger.create(crawl("https://a.example")).await.unwrap();
        let bad = ledger.create(crawl("https://b.example")).await.unwrap();
        ledger.create(crawl("https://c.example")).await.unwrap();

        engine.succeed(&ok, json!(null));
        engine.fail(&bad, TaskError::internal("boom"));
        ledger.refresh().await.unwrap();

        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.status_counts[&TaskStatus::Pending], 1);
        assert_eq!(stats.recent_success_rate, 0.5);
        assert_eq!(stats.failed_by_queue["default"], 1);
        assert_eq!(stats.worker_stats.len(), 1);
    }

    #[tokio::test]
    async fn predecessors_walk_the_chain() {
        let (_, ledger) = ledger();
        let first = ledger.create(crawl("https://example.org")).await.unwrap();
        let second = ledger
            .create(
                CreateTask::builder()
                    .task_name("crawl_site")
                    .kwargs(json!({"url": "https://example.org"}))
                    .retry_of(first.clone())
                    .root_task_id(first.clone())
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(ledger.predecessors(&second), vec![first.clone()]);
        assert_eq!(ledger.lineage_root(&second), Some(first));
    }
}
