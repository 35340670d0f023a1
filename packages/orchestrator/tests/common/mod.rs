// Common test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orchestrator::{
    CreateTask, FailureKind, MemoryAuditSink, MemoryEngine, OrchestrationContext,
    OrchestratorConfig, ProgressData, RecoveryConfig, TaskDefinition, TaskError,
};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const CRAWL_TASK: &str = "crawl_site";
pub const SYNC_TASK: &str = "sync_posts";

/// Orchestration context over a scriptable engine, an in-memory audit trail
/// and a throwaway checkpoint directory.
pub struct TestHarness {
    pub engine: Arc<MemoryEngine>,
    pub audit: Arc<MemoryAuditSink>,
    pub ctx: Arc<OrchestrationContext>,
    pub dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_definitions(vec![
            TaskDefinition::new(CRAWL_TASK).queue("crawling").require("url"),
            TaskDefinition::new(SYNC_TASK).prefers_resume(false),
        ])
        .await
    }

    pub async fn with_definitions(definitions: Vec<TaskDefinition>) -> Self {
        init_tracing();

        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(MemoryEngine::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let config = OrchestratorConfig {
            checkpoint_dir: dir.path().join("store"),
            audit_log_path: dir.path().join("audit.jsonl"),
            max_checkpoints_per_task: 10,
            ..Default::default()
        };

        let mut builder = OrchestrationContext::builder()
            .config(config)
            .engine(engine.clone())
            .audit(audit.clone())
            .default_recovery(RecoveryConfig::default());
        for definition in definitions {
            builder = builder.definition(definition);
        }
        let ctx = Arc::new(builder.build().await.expect("context"));

        Self {
            engine,
            audit,
            ctx,
            dir,
        }
    }

    /// Submit a crawl for `url`.
    pub async fn submit_crawl(&self, url: &str) -> String {
        self.ctx
            .ledger()
            .create(
                CreateTask::builder()
                    .task_name(CRAWL_TASK)
                    .kwargs(json!({ "url": url }))
                    .build(),
            )
            .await
            .expect("submit crawl")
    }

    pub async fn submit(&self, task_name: &str, kwargs: Value) -> String {
        self.ctx
            .ledger()
            .create(CreateTask::builder().task_name(task_name).kwargs(kwargs).build())
            .await
            .expect("submit")
    }

    /// Start and then fail a task on the engine, and let the ledger see it.
    pub async fn fail(&self, task_id: &str, kind: FailureKind, message: &str) {
        self.engine.start(task_id);
        assert!(
            self.engine.fail(task_id, TaskError::new(kind, message)),
            "task {task_id} could not be failed"
        );
        self.ctx.ledger().refresh().await.expect("refresh");
    }

    pub async fn checkpoint(&self, task_id: &str, task_name: &str, current: u64, total: u64) -> String {
        let id = self
            .ctx
            .checkpoints()
            .create(
                task_id,
                task_name,
                ProgressData::new(current, total, format!("{current}/{total}")),
                json!({ "cursor": current }),
                None,
            )
            .await
            .expect("checkpoint");
        // Keep checkpoint timestamps strictly ordered
        tokio::time::sleep(Duration::from_millis(5)).await;
        id
    }

    pub fn submission_count(&self) -> usize {
        self.engine.submitted().len()
    }
}

pub fn init_tracing() {
    // Run tests with: RUST_LOG=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
