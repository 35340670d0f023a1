// Orchestration daemon: runs the in-process engine and the orchestration loops

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator::engine::{handler_fn, LocalEngineConfig};
use orchestrator::{
    AuditSink, JsonlAuditSink, LocalEngine, OrchestrationContext, OrchestratorConfig,
    ScheduleConfig, ScheduleType, TaskDefinition,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEAT_TASK: &str = "orchestrator.heartbeat";
const HEARTBEAT_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting orchestration daemon");

    // Load configuration
    let config = OrchestratorConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        checkpoint_dir = %config.checkpoint_dir.display(),
        concurrency = config.local_concurrency,
        "Configuration loaded"
    );

    // In-process engine
    let engine = LocalEngine::new(LocalEngineConfig {
        concurrency: config.local_concurrency,
        ..Default::default()
    });
    let worker_id = engine.worker_id().to_string();
    engine.register(
        HEARTBEAT_TASK,
        handler_fn(move |invocation| {
            let worker_id = worker_id.clone();
            async move {
                tracing::debug!(task_id = %invocation.task_id, "Heartbeat");
                Ok(json!({ "worker": worker_id, "at": chrono::Utc::now() }))
            }
        }),
    );

    let audit = audit_sink(&config).await?;
    let report_path = config.report_path.clone();

    let context = Arc::new(
        OrchestrationContext::builder()
            .config(config)
            .engine(Arc::new(engine.clone()))
            .audit(audit)
            .definition(TaskDefinition::new(HEARTBEAT_TASK))
            .build()
            .await
            .context("Failed to build orchestration context")?,
    );

    context
        .scheduler()
        .add(
            ScheduleConfig::builder()
                .name("heartbeat")
                .task_name(HEARTBEAT_TASK)
                .schedule_type(ScheduleType::Interval)
                .interval_seconds(HEARTBEAT_INTERVAL_SECS)
                .build(),
        )
        .await
        .context("Failed to register heartbeat schedule")?;

    context.start();
    tracing::info!("Orchestration daemon running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    context.shutdown().await;
    engine.shutdown().await;

    if let Some(path) = report_path {
        context
            .export_system_report(&path)
            .await
            .with_context(|| format!("Failed to export system report to {}", path.display()))?;
    }

    tracing::info!("Orchestration daemon stopped");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn audit_sink(config: &OrchestratorConfig) -> Result<Arc<dyn AuditSink>> {
    if let Some(database_url) = &config.database_url {
        tracing::info!("Writing recovery audit trail to Postgres");
        let sink = orchestrator::audit::PostgresAuditSink::connect(database_url)
            .await
            .context("Failed to connect audit database")?;
        return Ok(Arc::new(sink));
    }
    Ok(jsonl_sink(config))
}

#[cfg(not(feature = "postgres"))]
async fn audit_sink(config: &OrchestratorConfig) -> Result<Arc<dyn AuditSink>> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled");
    }
    Ok(jsonl_sink(config))
}

fn jsonl_sink(config: &OrchestratorConfig) -> Arc<dyn AuditSink> {
    tracing::info!(path = %config.audit_log_path.display(), "Writing recovery audit trail to JSON lines");
    Arc::new(JsonlAuditSink::new(config.audit_log_path.clone()))
}
