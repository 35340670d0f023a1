//! Audit trail in the platform database, next to the regular sync records.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::{AuditRecord, AuditSink};
use crate::error::{OrchestratorError, Result};

/// Inserts one row per record into `orchestration_audit`.
#[derive(Clone)]
pub struct PostgresAuditSink {
    pool: PgPool,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the bundled migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(audit_error)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| OrchestratorError::Audit(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Records for one task, oldest first.
    pub async fn for_task(&self, task_id: &str) -> Result<Vec<AuditRecord>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT payload
            FROM orchestration_audit
            WHERE task_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(audit_error)?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_value(payload).map_err(Into::into))
            .collect()
    }
}

fn audit_error(e: sqlx::Error) -> OrchestratorError {
    OrchestratorError::Audit(e.to_string())
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        let payload = serde_json::to_value(&record)?;

        sqlx::query(
            r#"
            INSERT INTO orchestration_audit
                (id, record_type, task_id, checkpoint_id, recorded_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.record_type())
        .bind(record.task_id())
        .bind(record.checkpoint_id())
        .bind(record.timestamp())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(audit_error)?;

        Ok(())
    }
}
