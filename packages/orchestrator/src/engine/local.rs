//! In-process execution engine.
//!
//! Runs registered async handlers on the tokio runtime. Each submission gets
//! its own driver task that waits out the countdown/eta, takes a slot from the
//! concurrency semaphore, then runs the handler until it finishes, is revoked
//! with `terminate`, or the engine shuts down.
//!
//! ```text
//! submit ─► driver task
//!             ├─► wait for eta/countdown (cancellable)
//!             ├─► acquire permit (Semaphore)
//!             ├─► expired? ─► Revoked
//!             └─► run handler (spawned, abortable)
//!                     ├─► Ok ─► Success
//!                     ├─► transient Err + retries left ─► Retry ─► run again
//!                     └─► Err ─► Failure
//! ```
//!
//! Periodic registrations run through `tokio-cron-scheduler`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{OnceCell, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    EngineTaskInfo, EngineTaskState, ExecutionEngine, PeriodicSpec, PeriodicTrigger,
    RevokeOutcome, SubmitRequest, WorkerStats,
};
use crate::error::{FailureKind, OrchestratorError, Result, TaskError};
use crate::scheduler::CronExpression;
use crate::tasks::TaskStatus;

// ============================================================================
// Handlers
// ============================================================================

/// Everything a handler gets for one run.
#[derive(Clone)]
pub struct TaskInvocation {
    pub task_id: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Zero on the first run, incremented by engine-level retries
    pub attempt: u32,
    /// Cancelled when the task is terminated or the engine shuts down
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

/// Publishes handler progress as the task's `Progress` state.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Weak<Shared>,
    task_id: String,
}

impl ProgressReporter {
    pub fn report(&self, progress: Value) {
        if let Some(shared) = self.shared.upgrade() {
            shared.update(&self.task_id, |state| {
                state.status = TaskStatus::Progress;
                state.progress = Some(progress);
            });
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, invocation: TaskInvocation) -> std::result::Result<Value, TaskError>;
}

type BoxedHandlerFn = Box<
    dyn Fn(TaskInvocation) -> Pin<Box<dyn Future<Output = std::result::Result<Value, TaskError>> + Send>>
        + Send
        + Sync,
>;

struct FnHandler {
    run: BoxedHandlerFn,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn run(&self, invocation: TaskInvocation) -> std::result::Result<Value, TaskError> {
        (self.run)(invocation).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
///
/// ```ignore
/// engine.register("crawl_site", handler_fn(|invocation| async move {
///     let url = invocation.kwargs["url"].as_str().unwrap_or_default().to_string();
///     crawl(&url).await.map_err(TaskError::from)
/// }));
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler {
        run: Box::new(move |invocation| Box::pin(handler(invocation))),
    })
}

// ============================================================================
// Engine
// ============================================================================

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    /// Maximum number of handlers running at once
    pub concurrency: usize,
    /// Worker name reported in task state and worker stats
    pub worker_id: String,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            worker_id: format!("local-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

struct LocalTask {
    state: EngineTaskState,
    not_before: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    failed: u64,
    runtime_total: Duration,
}

struct Shared {
    config: LocalEngineConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    tasks: Mutex<HashMap<String, LocalTask>>,
    permits: Arc<Semaphore>,
    counters: Mutex<Counters>,
    periodic: tokio::sync::Mutex<HashMap<String, Uuid>>,
    periodic_runs: Mutex<HashMap<String, u64>>,
    periodic_fired: Mutex<Vec<String>>,
    scheduler: OnceCell<JobScheduler>,
    shutdown: CancellationToken,
}

impl Shared {
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocalTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_name)
            .cloned()
    }

    /// Apply `change` unless the task already reached a terminal status.
    fn update(&self, task_id: &str, change: impl FnOnce(&mut EngineTaskState)) -> bool {
        let mut tasks = self.tasks();
        match tasks.get_mut(task_id) {
            Some(task) if !task.state.status.is_terminal() => {
                change(&mut task.state);
                true
            }
            _ => false,
        }
    }

    fn record_run(&self, runtime: Duration, failed: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.processed += 1;
        counters.runtime_total += runtime;
        if failed {
            counters.failed += 1;
        }
    }

    fn submit(self: &Arc<Self>, request: SubmitRequest, origin: Option<String>) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::engine(
                FailureKind::ServiceUnavailable,
                "engine is shut down",
            ));
        }
        let handler = self.handler(&request.task_name).ok_or_else(|| {
            OrchestratorError::engine(
                FailureKind::InvalidData,
                format!("no handler registered for {}", request.task_name),
            )
        })?;

        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let not_before = request.not_before(now);
        let cancel = self.shutdown.child_token();

        self.tasks().insert(
            task_id.clone(),
            LocalTask {
                state: EngineTaskState {
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
                },
                not_before,
                cancel: cancel.clone(),
            },
        );

        debug!(task_id = %task_id, task_name = %request.task_name, "Task accepted");
        tokio::spawn(drive(
            self.clone(),
            task_id.clone(),
            handler,
            request,
            not_before,
            cancel,
        ));
        Ok(task_id)
    }

    async fn fire_periodic(self: &Arc<Self>, spec: &PeriodicSpec) {
        let mut request = SubmitRequest::new(spec.task_name.clone(), spec.queue.clone());
        request.args = spec.args.clone();
        request.kwargs = spec.kwargs.clone();
        request.priority = spec.priority;

        match self.submit(request, Some(spec.name.clone())) {
            Ok(task_id) => {
                *self
                    .periodic_runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(spec.name.clone())
                    .or_insert(0) += 1;
                self.periodic_fired
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(task_id.clone());
                info!(schedule = %spec.name, task_id = %task_id, "Periodic schedule fired");
            }
            Err(e) => error!(schedule = %spec.name, error = %e, "Periodic submission failed"),
        }
    }
}

/// Runs registered handlers on the current tokio runtime.
#[derive(Clone)]
pub struct LocalEngine {
    shared: Arc<Shared>,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                handlers: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                permits,
                counters: Mutex::new(Counters::default()),
                periodic: tokio::sync::Mutex::new(HashMap::new()),
                periodic_runs: Mutex::new(HashMap::new()),
                periodic_fired: Mutex::new(Vec::new()),
                scheduler: OnceCell::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register the handler for `task_name`, replacing any previous one.
    pub fn register(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_name.into(), handler);
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Stop accepting work, interrupt running handlers and stop periodic schedules.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        if let Some(scheduler) = self.shared.scheduler.get() {
            let mut scheduler = scheduler.clone();
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Periodic scheduler did not shut down cleanly");
            }
        }
        info!(worker = %self.shared.config.worker_id, "Local engine stopped");
    }

    async fn scheduler(&self) -> Result<&JobScheduler> {
        self.shared
            .scheduler
            .get_or_try_init(|| async {
                let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
                scheduler.start().await.map_err(scheduler_error)?;
                Ok::<_, OrchestratorError>(scheduler)
            })
            .await
    }

    fn periodic_job(&self, spec: PeriodicSpec) -> Result<Job> {
        let shared = Arc::downgrade(&self.shared);
        let trigger = spec.trigger.clone();
        let run = move |_uuid: Uuid, _lock: JobScheduler| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let shared = shared.clone();
            let spec = spec.clone();
            Box::pin(async move {
                if let Some(shared) = shared.upgrade() {
                    shared.fire_periodic(&spec).await;
                }
            })
        };

        match trigger {
            PeriodicTrigger::Interval(every) => {
                Job::new_repeated_async(every, run).map_err(scheduler_error)
            }
            PeriodicTrigger::Cron(expression) => {
                let cron = CronExpression::parse(&expression)
                    .map_err(|reason| OrchestratorError::engine(FailureKind::InvalidData, reason))?;
                Job::new_async(cron.to_scheduler_format(), run).map_err(scheduler_error)
            }
        }
    }

    fn listing(&self, keep: impl Fn(&LocalTask) -> bool) -> Vec<EngineTaskInfo> {
        let tasks = self.shared.tasks();
        let mut rows: Vec<EngineTaskInfo> = tasks
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
        rows.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        rows
    }
}

fn scheduler_error(e: JobSchedulerError) -> OrchestratorError {
    OrchestratorError::engine(FailureKind::Internal, format!("periodic scheduler: {e}"))
}

async fn drive(
    shared: Arc<Shared>,
    task_id: String,
    handler: Arc<dyn TaskHandler>,
    request: SubmitRequest,
    not_before: Option<DateTime<Utc>>,
    cancel: CancellationToken,
) {
    if let Some(at) = not_before {
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = shared.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    if request.expires.is_some_and(|expires| Utc::now() > expires) {
        shared.update(&task_id, |state| state.status = TaskStatus::Revoked);
        info!(task_id = %task_id, "Task expired before it could start");
        return;
    }

    let max_retries = request.retry_policy.map_or(0, |policy| policy.max_retries);
    let mut attempt = 0;

    loop {
        let worker = shared.config.worker_id.clone();
        let started = shared.update(&task_id, |state| {
            state.status = TaskStatus::Started;
            state.worker = Some(worker);
        });
        if !started {
            return;
        }

        let invocation = TaskInvocation {
            task_id: task_id.clone(),
            task_name: request.task_name.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            attempt,
            cancel: cancel.child_token(),
            progress: ProgressReporter {
                shared: Arc::downgrade(&shared),
                task_id: task_id.clone(),
            },
        };

        let clock = Instant::now();
        let run = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.run(invocation).await })
        };
        let abort = run.abort_handle();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                None
            }
            joined = run => Some(joined.unwrap_or_else(|e| {
                Err(TaskError::internal(format!("handler panicked: {e}")))
            })),
        };
        let runtime = clock.elapsed();

        let Some(outcome) = outcome else {
            // Revoked tasks are already terminal; anything else lost its worker
            let lost = shared.update(&task_id, |state| {
                state.status = TaskStatus::Failure;
                state.error = Some(TaskError::new(
                    FailureKind::WorkerLost,
                    "worker shut down while the task was running",
                ));
            });
            shared.record_run(runtime, lost);
            warn!(task_id = %task_id, lost, "Task interrupted");
            return;
        };

        match outcome {
            Ok(result) => {
                shared.update(&task_id, |state| {
                    state.status = TaskStatus::Success;
                    state.result = Some(result);
                });
                shared.record_run(runtime, false);
                debug!(task_id = %task_id, runtime_ms = runtime.as_millis() as u64, "Task succeeded");
                return;
            }
            Err(error) if error.kind.is_transient() && attempt < max_retries => {
                warn!(
                    task_id = %task_id,
                    attempt,
                    kind = %error.kind,
                    error = %error.message,
                    "Task failed, engine will retry"
                );
                shared.update(&task_id, |state| {
                    state.status = TaskStatus::Retry;
                    state.error = Some(error);
                });
                attempt += 1;

                let interval = request
                    .retry_policy
                    .map(|policy| policy.interval)
                    .unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Err(error) => {
                warn!(
                    task_id = %task_id,
                    kind = %error.kind,
                    error = %error.message,
                    "Task failed"
                );
                shared.update(&task_id, |state| {
                    state.status = TaskStatus::Failure;
                    state.error = Some(error);
                });
                shared.record_run(runtime, true);
                return;
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    async fn submit(&self, request: SubmitRequest) -> Result<String> {
        self.shared.submit(request, None)
    }

    async fn query(&self, task_id: &str) -> Result<Option<EngineTaskState>> {
        Ok(self
            .shared
            .tasks()
            .get(task_id)
            .map(|task| task.state.clone()))
    }

    async fn inspect_active(&self) -> Result<Vec<EngineTaskInfo>> {
        Ok(self.listing(|task| task.state.status.is_active()))
    }

    async fn inspect_scheduled(&self) -> Result<Vec<EngineTaskInfo>> {
        let now = Utc::now();
        Ok(self.listing(|task| {
            task.state.status == TaskStatus::Pending && task.not_before.is_some_and(|at| at > now)
        }))
    }

    async fn inspect_reserved(&self) -> Result<Vec<EngineTaskInfo>> {
        let now = Utc::now();
        Ok(self.listing(|task| {
            task.state.status == TaskStatus::Pending
                && task.not_before.map_or(true, |at| at <= now)
        }))
    }

    async fn worker_stats(&self) -> Result<Vec<WorkerStats>> {
        let active = self
            .shared
            .tasks()
            .values()
            .filter(|task| task.state.status.is_active())
            .count();
        let counters = self.shared.counters.lock().unwrap_or_else(|e| e.into_inner());
        let avg_runtime_secs = (counters.processed > 0)
            .then(|| counters.runtime_total.as_secs_f64() / counters.processed as f64);

        Ok(vec![WorkerStats {
            worker: self.shared.config.worker_id.clone(),
            online: !self.shared.shutdown.is_cancelled(),
            concurrency: self.shared.config.concurrency,
            active,
            processed: counters.processed,
            failed: counters.failed,
            avg_runtime_secs,
        }])
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<RevokeOutcome> {
        let mut tasks = self.shared.tasks();
        let Some(task) = tasks.get_mut(task_id) else {
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
            task.cancel.cancel();
            info!(task_id = %task_id, terminate, "Task revoked");
        }
        Ok(outcome)
    }

    async fn register_periodic(&self, spec: PeriodicSpec) -> Result<()> {
        let name = spec.name.clone();
        let job = self.periodic_job(spec)?;
        let scheduler = self.scheduler().await?;

        let mut periodic = self.shared.periodic.lock().await;
        if let Some(previous) = periodic.remove(&name) {
            scheduler.remove(&previous).await.map_err(scheduler_error)?;
        }
        let job_id = scheduler.add(job).await.map_err(scheduler_error)?;
        periodic.insert(name.clone(), job_id);

        info!(schedule = %name, job_id = %job_id, "Periodic schedule registered");
        Ok(())
    }

    async fn unregister_periodic(&self, name: &str) -> Result<bool> {
        let mut periodic = self.shared.periodic.lock().await;
        let Some(job_id) = periodic.remove(name) else {
            return Ok(false);
        };
        if let Some(scheduler) = self.shared.scheduler.get() {
            scheduler.remove(&job_id).await.map_err(scheduler_error)?;
        }
        info!(schedule = %name, "Periodic schedule unregistered");
        Ok(true)
    }

    async fn periodic_runs(&self) -> Result<HashMap<String, u64>> {
        Ok(self
            .shared
            .periodic_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn take_periodic_fired(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(
            &mut *self
                .shared
                .periodic_fired
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        ))
    }
}
