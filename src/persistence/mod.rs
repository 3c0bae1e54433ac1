//! Persistence: the system of record for executions and their stages

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRepository;

use crate::core::model::{ExecutionType, PipelineExecution, StageExecution};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors surfaced by a repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The execution does not exist; the referencing message is malformed.
    #[error("{execution_type:?} execution {id} not found")]
    NotFound {
        execution_type: ExecutionType,
        id: Uuid,
    },

    /// The backing store misbehaved; the operation may be retried.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Durable store for executions.
///
/// The scheduler holds only transient per-handler snapshots; every
/// mutation is written back through one of these methods, atomically per
/// execution or per stage.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn retrieve(
        &self,
        execution_type: ExecutionType,
        id: Uuid,
    ) -> Result<PipelineExecution, RepositoryError>;

    /// Store the full execution, stages included.
    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError>;

    /// Persist execution-level fields without touching stages.
    async fn update_status(&self, execution: &PipelineExecution) -> Result<(), RepositoryError>;

    /// Persist a single stage of an already-stored execution.
    async fn store_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError>;

    /// Persist only a stage's context and outputs.
    async fn update_stage_context(&self, stage: &StageExecution) -> Result<(), RepositoryError>;

    /// All executions sharing a pipeline config, any status.
    async fn retrieve_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<Vec<PipelineExecution>, RepositoryError>;
}

/// In-memory repository (tests and ephemeral use)
#[derive(Default)]
pub struct InMemoryRepository {
    executions: RwLock<HashMap<Uuid, PipelineExecution>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn retrieve(
        &self,
        execution_type: ExecutionType,
        id: Uuid,
    ) -> Result<PipelineExecution, RepositoryError> {
        let executions = self.executions.read().await;
        executions
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound { execution_type, id })
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_status(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(stored) => {
                stored.status = execution.status;
                stored.start_time = execution.start_time;
                stored.end_time = execution.end_time;
                stored.canceled = execution.canceled;
                stored.canceled_by = execution.canceled_by.clone();
                stored.cancellation_reason = execution.cancellation_reason.clone();
                stored.paused = execution.paused;
                Ok(())
            }
            None => {
                executions.insert(execution.id, execution.clone());
                Ok(())
            }
        }
    }

    async fn store_stage(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&stage.execution_id)
            .ok_or(RepositoryError::NotFound {
                execution_type: ExecutionType::Pipeline,
                id: stage.execution_id,
            })?;
        execution.update_stage(stage.clone());
        Ok(())
    }

    async fn update_stage_context(&self, stage: &StageExecution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&stage.execution_id)
            .ok_or(RepositoryError::NotFound {
                execution_type: ExecutionType::Pipeline,
                id: stage.execution_id,
            })?;
        if let Some(stored) = execution.stage_by_id_mut(stage.id) {
            stored.context = stage.context.clone();
            stored.outputs = stage.outputs.clone();
        }
        Ok(())
    }

    async fn retrieve_for_config(
        &self,
        pipeline_config_id: &str,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<PipelineExecution> = executions
            .values()
            .filter(|e| e.pipeline_config_id.as_deref() == Some(pipeline_config_id))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.build_time);
        Ok(matching)
    }
}
