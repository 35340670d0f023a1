//! Scriptable in-memory engine.
//!
//! Nothing runs on its own: tests drive each task through `start`,
//! `succeed` and `fail`, and fire periodic schedules by hand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    EngineTaskInfo, EngineTaskState, ExecutionEngine, PeriodicSpec, RevokeOutcome, SubmitRequest,
    WorkerStats,
};
use crate::error::{FailureKind, OrchestratorError, Result, TaskError};
use crate::tasks::TaskStatus;

const WORKER: &str = "memory-worker";

struct MemoryTask {
    state: EngineTaskState,
    not_before: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    tasks: HashMap<String, MemoryTask>,
    submitted: Vec<(String, SubmitRequest)>,
    periodic: BTreeMap<String, PeriodicSpec>,
    periodic_runs: HashMap<String, u64>,
    periodic_fired: Vec<String>,
    workers: Option<Vec<WorkerStats>>,
    reject_with: Option<FailureKind>,
    introspection_error: Option<FailureKind>,
    introspection_delay: Option<Duration>,
    revocations: Vec<(String, bool)>,
}

/// In-memory [`ExecutionEngine`] whose state is advanced explicitly.
#[derive(Default)]
pub struct MemoryEngine {
    inner: Mutex<Inner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(inner: &mut Inner, request: SubmitRequest, origin: Option<String>) -> String {
        inner.next_id += 1;
        let task_id = format!("mem-{}", inner.next_id);
        let now = Utc::now();
        let state = EngineTaskState {
            task_name: request.task_name.clone(),
            queue: request.queue.clone(),
            status: TaskStatus::Pending,
            priority: request.priority,
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            received_at: now,
            result: None,
            error: None,
            progress: None,
            worker: None,
            origin,
        };
        inner.tasks.insert(
            task_id.clone(),
            MemoryTask {
                state,
                not_before: request.not_before(now),
            },
        );
        inner.submitted.push((task_id.clone(), request));
        task_id
    }

    fn update(&self, task_id: &str, apply: impl FnOnce(&mut EngineTaskState)) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(task_id) {
            Some(task) if !task.state.status.is_terminal() => {
                apply(&mut task.state);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Move a pending task onto the worker.
    pub fn start(&self, task_id: &str) -> bool {
        self.update(task_id, |state| {
            state.status = TaskStatus::Started;
            state.worker = Some(WORKER.to_string());
        })
    }

    pub fn progress(&self, task_id: &str, progress: Value) -> bool {
        self.update(task_id, |state| {
            state.status = TaskStatus::Progress;
            state.worker.get_or_insert_with(|| WORKER.to_string());
            state.progress = Some(progress);
        })
    }

    pub fn succeed(&self, task_id: &str, result: Value) -> bool {
        self.update(task_id, |state| {
            state.status = TaskStatus::Success;
            state.result = Some(result);
        })
    }

    pub fn fail(&self, task_id: &str, error: TaskError) -> bool {
        self.update(task_id, |state| {
            state.status = TaskStatus::Failure;
            state.error = Some(error);
        })
    }

    /// Drop a task, as an engine does once its result backend expires.
    pub fn forget(&self, task_id: &str) -> bool {
        self.lock().tasks.remove(task_id).is_some()
    }

    /// Simulate a periodic trigger. Returns `None` when the schedule is not registered.
    pub fn fire_periodic(&self, name: &str) -> Option<String> {
        let mut inner = self.lock();
        let spec = inner.periodic.get(name)?.clone();
        let mut request = SubmitRequest::new(spec.task_name, spec.queue);
        request.args = spec.args;
        request.kwargs = spec.kwargs;
        request.priority = spec.priority;
        let task_id = Self::insert(&mut inner, request, Some(name.to_string()));
        *inner.periodic_runs.entry(name.to_string()).or_insert(0) += 1;
        inner.periodic_fired.push(task_id.clone());
        Some(task_id)
    }

    pub fn is_periodic_registered(&self, name: &str) -> bool {
        self.lock().periodic.contains_key(name)
    }

    /// Every accepted submission, oldest first.
    pub fn submitted(&self) -> Vec<(String, SubmitRequest)> {
        self.lock().submitted.clone()
    }

    pub fn submission(&self, task_id: &str) -> Option<SubmitRequest> {
        self.lock()
            .submitted
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, request)| request.clone())
    }

    pub fn revocations(&self) -> Vec<(String, bool)> {
        self.lock().revocations.clone()
    }

    pub fn set_workers(&self, workers: Vec<WorkerStats>) {
        self.lock().workers = Some(workers);
    }

    /// Make `submit` fail with `kind` until cleared with `None`.
    pub fn reject_submissions(&self, kind: Option<FailureKind>) {
        self.lock().reject_with = kind;
    }

    /// Make inspect_* and worker_stats fail with `kind` until cleared.
    pub fn fail_introspection(&self, kind: Option<FailureKind>) {
        self.lock().introspection_error = kind;
    }

    /// Make inspect_* and worker_stats sleep before answering.
    pub fn delay_introspection(&self, delay: Option<Duration>) {
        self.lock().introspection_delay = delay;
    }

    async fn introspect<T>(&self, read: impl FnOnce(&Inner) -> T) -> Result<T> {
        let (error, delay) = {
            let inner = self.lock();
            (inner.introspection_error, inner.introspection_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = error {
            return Err(OrchestratorError::engine(kind, "inspection unavailable"));
        }
        Ok(read(&self.lock()))
    }

    fn listing(inner: &Inner, keep: impl Fn(&MemoryTask) -> bool) -> Vec<EngineTaskInfo> {
        let mut rows: Vec<EngineTaskInfo> = inner
            .tasks
            .iter()
            .filter(|(_, task)| keep(task))
            .map(|(task_id, task)| EngineTaskInfo {
                task_id: task_id.clone(),
                task_name: task.state.task_name.clone(),
                queue: task.state.queue.clone(),
                priority: task.state.priority,
                worker: task.state.worker.clone(),
                eta: task.not_before,
                received_at: task.state.received_at,
            })
            .collect();
        rows.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.task_id.cmp(&b.task_id)));
        rows
    }
}

#[async_trait]
impl ExecutionEngine for MemoryEngine {
    async fn submit(&self, request: SubmitRequest) -> Result<String> {
        let mut inner = self.lock();
        if let Some(kind) = inner.reject_with {
            return Err(OrchestratorError::engine(kind, "submission rejected"));
        }
        Ok(Self::insert(&mut inner, request, None))
    }

    async fn query(&self, task_id: &str) -> Result<Option<EngineTaskState>> {
        Ok(self.lock().tasks.get(task_id).map(|task| task.state.clone()))
    }

    async fn inspect_active(&self) -> Result<Vec<EngineTaskInfo>> {
        self.introspect(|inner| Self::listing(inner, |task| task.state.status.is_active()))
            .await
    }

    async fn inspect_scheduled(&self) -> Result<Vec<EngineTaskInfo>> {
        let now = Utc::now();
        self.introspect(|inner| {
            Self::listing(inner, |task| {
                task.state.status == TaskStatus::Pending
                    && task.not_before.is_some_and(|at| at > now)
            })
        })
        .await
    }

    async fn inspect_reserved(&self) -> Result<Vec<EngineTaskInfo>> {
        let now = Utc::now();
        self.introspect(|inner| {
            Self::listing(inner, |task| {
                task.state.status == TaskStatus::Pending
                    && task.not_before.map_or(true, |at| at <= now)
            })
        })
        .await
    }

    async fn worker_stats(&self) -> Result<Vec<WorkerStats>> {
        self.introspect(|inner| {
            if let Some(workers) = &inner.workers {
                return workers.clone();
            }
            let mut active = 0;
            let mut processed = 0;
            let mut failed = 0;
            for task in inner.tasks.values() {
                match task.state.status {
                    status if status.is_active() => active += 1,
                    TaskStatus::Success => processed += 1,
                    TaskStatus::Failure => {
                        processed += 1;
                        failed += 1;
                    }
                    _ => {}
                }
            }
            vec![WorkerStats {
                worker: WORKER.to_string(),
                online: true,
                concurrency: 4,
                active,
                processed,
                failed,
                avg_runtime_secs: None,
            }]
        })
        .await
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<RevokeOutcome> {
        let mut inner = self.lock();
        inner.revocations.push((task_id.to_string(), terminate));
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(RevokeOutcome::NotFound);
        };
        let outcome = match task.state.status {
            status if status.is_terminal() => RevokeOutcome::AlreadyFinished,
            TaskStatus::Pending => RevokeOutcome::Revoked,
            _ if terminate => RevokeOutcome::Revoked,
            _ => RevokeOutcome::AlreadyRunning,
        };
        if outcome == RevokeOutcome::Revoked {
            task.state.status = TaskStatus::Revoked;
        }
        Ok(outcome)
    }

    async fn register_periodic(&self, spec: PeriodicSpec) -> Result<()> {
        self.lock().periodic.insert(spec.name.clone(), spec);
        Ok(())
    }

    async fn unregister_periodic(&self, name: &str) -> Result<bool> {
        Ok(self.lock().periodic.remove(name).is_some())
    }

    async fn periodic_runs(&self) -> Result<HashMap<String, u64>> {
        Ok(self.lock().periodic_runs.clone())
    }

    async fn take_periodic_fired(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.lock().periodic_fired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PeriodicTrigger;
    use crate::tasks::TaskPriority;

    #[tokio::test]
    async fn pending_task_is_revoked_without_terminate() {
        let engine = MemoryEngine::new();
        let id = engine
            .submit(SubmitRequest::new("crawl_site", "default"))
            .await
            .unwrap();
        assert_eq!(engine.revoke(&id, false).await.unwrap(), RevokeOutcome::Revoked);
        assert_eq!(
            engine.query(&id).await.unwrap().unwrap().status,
            TaskStatus::Revoked
        );
    }

    #[tokio::test]
    async fn running_task_needs_terminate() {
        let engine = MemoryEngine::new();
        let id = engine
            .submit(SubmitRequest::new("crawl_site", "default"))
            .await
            .unwrap();
        engine.start(&id);

        assert_eq!(
            engine.revoke(&id, false).await.unwrap(),
            RevokeOutcome::AlreadyRunning
        );
        assert_eq!(engine.revoke(&id, true).await.unwrap(), RevokeOutcome::Revoked);
        assert_eq!(engine.revocations().len(), 2);
    }

    #[tokio::test]
    async fn countdown_tasks_are_listed_as_scheduled() {
        let engine = MemoryEngine::new();
        let mut later = SubmitRequest::new("crawl_site", "default");
        later.countdown = Some(Duration::from_secs(600));
        engine.submit(later).await.unwrap();
        engine
            .submit(SubmitRequest::new("crawl_site", "default"))
            .await
            .unwrap();

        assert_eq!(engine.inspect_scheduled().await.unwrap().len(), 1);
        assert_eq!(engine.inspect_reserved().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_schedule_does_not_fire() {
        let engine = MemoryEngine::new();
        engine
            .register_periodic(PeriodicSpec {
                name: "nightly".into(),
                task_name: "sync_source".into(),
                args: vec![],
                kwargs: Default::default(),
                queue: "default".into(),
                priority: TaskPriority::Normal,
                trigger: PeriodicTrigger::Cron("0 2 * * *".into()),
            })
            .await
            .unwrap();

        assert!(engine.fire_periodic("nightly").is_some());
        assert!(engine.unregister_periodic("nightly").await.unwrap());
        assert!(engine.fire_periodic("nightly").is_none());
        assert_eq!(engine.periodic_runs().await.unwrap()["nightly"], 1);
    }

    #[tokio::test]
    async fn rejected_submission_surfaces_kind() {
        let engine = MemoryEngine::new();
        engine.reject_submissions(Some(FailureKind::ServiceUnavailable));
        let err = engine
            .submit(SubmitRequest::new("crawl_site", "default"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Engine {
                kind: FailureKind::ServiceUnavailable,
                ..
            }
        ));
    }
}
