//! SQLite-backed execution repository

use crate::core::model::{ExecutionType, PipelineExecution, StageExecution};
use crate::persistence::{ExecutionRepository, RepositoryError};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite repository.
///
/// The full execution is stored as a JSON body alongside the columns the
/// engine queries on. Per-stage writes are read-modify-write inside a
/// transaction, which keeps them atomic at the execution row.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn new(db_path: &str) -> Result<Self, RepositoryError> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .context("Failed to connect to database")?;

        let repository = Self { pool };
        repository.init().await?;

        Ok(repository)
    }

    /// Create a repository at the platform-local data directory.
    pub async fn with_default_path() -> Result<Self, RepositoryError> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("cascade");
        std::fs::create_dir_all(&db_dir).context("Failed to create data directory")?;

        let db_path = db_dir.join("executions.db");
        Self::new(db_path.to_str().unwrap_or("executions.db")).await
    }

    async fn init(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                execution_type TEXT NOT NULL,
                application TEXT NOT NULL,
                pipeline_config_id TEXT,
                status TEXT NOT NULL,
                build_time TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_application ON executions(application);
            CREATE INDEX IF NOT EXISTS idx_config_id ON executions(pipeline_config_id);
            CREATE INDEX IF NOT EXISTS idx_status ON executions(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    fn decode(body: &str) -> Result<PipelineExecution, RepositoryError> {
        serde_json::from_str(body)
            .map_err(|e| RepositoryError::Storage(anyhow!("corrupt execution body: {e}")))
    }

    async fn write(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(execution)
            .map_err(|e| RepositoryError::Storage(anyhow!("unencodable execution: {e}")))?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
            (id, execution_type, application, pipeline_config_id, status, build_time, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(format!("{:?}", execution.execution_type))
        .bind(&execution.application)
        .bind(&execution.pipeline_config_id)
        .bind(execution.status.to_string())
        .bind(execution.build_time.to_rfc3339())
        .bind(body)
        .execute(&self.pool)
        .await
        .context("Failed to store execution")?;

        Ok(())
    }

    /// Apply `mutate` to the stored execution under a transaction.
    async fn modify<F>(
        &self,
        execution_id: Uuid,
        mutate: F,
    ) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut PipelineExecution),
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let row = sqlx::query("SELECT body FROM executions WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to load execution")?
            .ok_or(RepositoryError::NotFound {
                execution_type: ExecutionType::Pipeline,
                id: execution_id,
            })?;

        let mut execution = Self::decode(&row.get::<String, _>("body"))?;
        mutate(&mut execution);

        let body = serde_json::to_string(&execution)
            .map_err(|e| RepositoryError::Storage(anyhow!("unencodable execution: {e}")))?;
        sqlx::query("UPDATE executions SET status = ?1, body = ?2 WHERE id = ?3")
            .bind(execution.status.to_string())
            .bind(body)
            .bind(execution_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to update execution")?;

        tx.commit().await.context("Failed to commit")?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for SqliteRepository {
    async fn retrieve(
        &self,
        execution_type: ExecutionType,
        id: Uuid,
    ) -> Result<PipelineExecution, RepositoryError> {
        let row = sqlx::query("SELECT body FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        match row {
            Some(row) => Self::decode(&row.get::<String, _>("body")),
            None => Err(RepositoryError::NotFound { execution_type, id }),
        }
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        self.write(execution).await
    }

    async fn update_status(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        let update = execution.clone();
        self.modify(execution.id, move |stored| {
            stored.status = update.status;
            stored.start_time = update.start_time;
            stored.end_time = update.end_time;
            stored.canceled = update.canceled;
            stored.canceled_by = update.canceled_by.clone();
            stored.cancellation_reason = update.cancellation_reason.clone();
            stored.paused = update.paused;
        })
        .await
    }

    async fn store_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let stage = stage.clone();
        self.modify(stage.execution_id, move |stored| {
            stored.update_stage(stage);
        })
        .await
    }

    async fn update_stage_context(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let stage = stage.clone();
        self.modify(stage.execution_id, move |stored| {
            if let Some(existing) = stored.stage_by_id_mut(stage.id) {
                existing.context = stage.context.clone();
                existing.outputs = stage.outputs.clone();
            }
        })
        .await
    }

    async fn retrieve_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM executions WHERE pipeline_config_id = ?1 ORDER BY build_time ASC",
        )
        .bind(pipeline_config_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter()
            .map(|row| Self::decode(&row.get::<String, _>("body")))
            .collect()
    }
}
