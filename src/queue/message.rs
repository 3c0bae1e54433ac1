//! Message taxonomy exchanged through the queue

use crate::core::model::{ExecutionType, PipelineExecution};
use crate::core::status::ExecutionStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued command.
///
/// Every message names the execution it operates on; the payload carries
/// the handler-specific fields. Messages are replayable: handlers are
/// idempotent with respect to `identity()` and the resulting status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub execution_type: ExecutionType,
    pub execution_id: Uuid,
    pub application: String,
    /// Redelivery counter, carried across handler re-queues
    #[serde(default)]
    pub attempts: u32,
    #[serde(flatten)]
    pub payload: MessageKind,
}

/// Handler-specific payloads, one variant per message kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageKind {
    // execution tier
    StartExecution,
    CompleteExecution,
    CancelExecution {
        user: Option<String>,
        reason: Option<String>,
    },
    ResumeExecution,
    RescheduleExecution,
    StartWaitingExecutions {
        pipeline_config_id: String,
        purge_queue: bool,
    },

    // stage tier
    StartStage {
        stage_id: Uuid,
    },
    CompleteStage {
        stage_id: Uuid,
    },
    SkipStage {
        stage_id: Uuid,
        user: Option<String>,
    },
    AbortStage {
        stage_id: Uuid,
    },
    CancelStage {
        stage_id: Uuid,
    },
    RestartStage {
        stage_id: Uuid,
        user: Option<String>,
    },
    PauseStage {
        stage_id: Uuid,
    },
    ResumeStage {
        stage_id: Uuid,
    },
    ContinueParentStage {
        stage_id: Uuid,
    },

    // task tier
    StartTask {
        stage_id: Uuid,
        task_id: String,
    },
    RunTask {
        stage_id: Uuid,
        task_id: String,
    },
    CompleteTask {
        stage_id: Uuid,
        task_id: String,
        status: ExecutionStatus,
        original_status: Option<ExecutionStatus>,
    },
    PauseTask {
        stage_id: Uuid,
        task_id: String,
    },
    ResumeTask {
        stage_id: Uuid,
        task_id: String,
    },

    // markers for messages that exhausted their attempts or reference
    // entities that do not exist
    InvalidExecution {
        reason: String,
    },
    InvalidStage {
        stage_id: Uuid,
        reason: String,
    },
    InvalidTask {
        stage_id: Uuid,
        task_id: String,
        reason: String,
    },
}

/// Idempotency key: duplicates of the same identity collapse while queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    pub kind: &'static str,
    pub execution_id: Uuid,
    pub stage_id: Option<Uuid>,
    pub task_id: Option<String>,
}

impl Message {
    pub fn new(execution: &PipelineExecution, payload: MessageKind) -> Self {
        Self {
            execution_type: execution.execution_type,
            execution_id: execution.id,
            application: execution.application.clone(),
            attempts: 0,
            payload,
        }
    }

    /// The same message again, with the redelivery counter bumped.
    pub fn requeued(&self) -> Self {
        let mut message = self.clone();
        message.attempts += 1;
        message
    }

    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            MessageKind::StartExecution => "startExecution",
            MessageKind::CompleteExecution => "completeExecution",
            MessageKind::CancelExecution { .. } => "cancelExecution",
            MessageKind::ResumeExecution => "resumeExecution",
            MessageKind::RescheduleExecution => "rescheduleExecution",
            MessageKind::StartWaitingExecutions { .. } => "startWaitingExecutions",
            MessageKind::StartStage { .. } => "startStage",
            MessageKind::CompleteStage { .. } => "completeStage",
            MessageKind::SkipStage { .. } => "skipStage",
            MessageKind::AbortStage { .. } => "abortStage",
            MessageKind::CancelStage { .. } => "cancelStage",
            MessageKind::RestartStage { .. } => "restartStage",
            MessageKind::PauseStage { .. } => "pauseStage",
            MessageKind::ResumeStage { .. } => "resumeStage",
            MessageKind::ContinueParentStage { .. } => "continueParentStage",
            MessageKind::StartTask { .. } => "startTask",
            MessageKind::RunTask { .. } => "runTask",
            MessageKind::CompleteTask { .. } => "completeTask",
            MessageKind::PauseTask { .. } => "pauseTask",
            MessageKind::ResumeTask { .. } => "resumeTask",
            MessageKind::InvalidExecution { .. } => "invalidExecution",
            MessageKind::InvalidStage { .. } => "invalidStage",
            MessageKind::InvalidTask { .. } => "invalidTask",
        }
    }

    pub fn stage_id(&self) -> Option<Uuid> {
        match &self.payload {
            MessageKind::StartStage { stage_id }
            | MessageKind::CompleteStage { stage_id }
            | MessageKind::SkipStage { stage_id, .. }
            | MessageKind::AbortStage { stage_id }
            | MessageKind::CancelStage { stage_id }
            | MessageKind::RestartStage { stage_id, .. }
            | MessageKind::PauseStage { stage_id }
            | MessageKind::ResumeStage { stage_id }
            | MessageKind::ContinueParentStage { stage_id }
            | MessageKind::StartTask { stage_id, .. }
            | MessageKind::RunTask { stage_id, .. }
            | MessageKind::CompleteTask { stage_id, .. }
            | MessageKind::PauseTask { stage_id, .. }
            | MessageKind::ResumeTask { stage_id, .. }
            | MessageKind::InvalidStage { stage_id, .. }
            | MessageKind::InvalidTask { stage_id, .. } => Some(*stage_id),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match &self.payload {
            MessageKind::StartTask { task_id, .. }
            | MessageKind::RunTask { task_id, .. }
            | MessageKind::CompleteTask { task_id, .. }
            | MessageKind::PauseTask { task_id, .. }
            | MessageKind::ResumeTask { task_id, .. }
            | MessageKind::InvalidTask { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity {
            kind: self.kind_name(),
            execution_id: self.execution_id,
            stage_id: self.stage_id(),
            task_id: self.task_id().map(str::to_string),
        }
    }
}
