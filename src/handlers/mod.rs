//! Message dispatch: the worker loop that drives all executions

pub mod admission;
pub mod execution;
pub mod expand;
pub mod retry;
pub mod stage;
pub mod task;

pub use admission::AdmissionController;
pub use retry::RetryPolicy;

use crate::core::config::EngineConfig;
use crate::core::model::{ExecutionType, PipelineExecution};
use crate::events::EventPublisher;
use crate::persistence::{ExecutionRepository, RepositoryError};
use crate::queue::{Delivery, Message, MessageKind, QueueTransport};
use crate::stages::StageCatalog;
use crate::tasks::TaskRegistry;
use metrics::counter;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long to back off when another worker holds the execution lock
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Why a handler could not complete
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{execution_type:?} execution {id} not found")]
    ExecutionNotFound {
        execution_type: ExecutionType,
        id: Uuid,
    },

    #[error("stage {stage_id} not found in execution {execution_id}")]
    StageNotFound { execution_id: Uuid, stage_id: Uuid },

    #[error("task {task_id} not found in stage {stage_id}")]
    TaskNotFound { stage_id: Uuid, task_id: String },

    /// Retryable: the message is redelivered with backoff.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<RepositoryError> for HandlerError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound { execution_type, id } => {
                HandlerError::ExecutionNotFound { execution_type, id }
            }
            RepositoryError::Storage(source) => HandlerError::Transient(source),
        }
    }
}

/// Routes each queued message to its handler and enforces at-least-once
/// semantics: ack on success, redeliver with backoff on transient failure,
/// convert to an invalid marker past the attempts ceiling.
///
/// Holds all process-wide state; handlers receive read-only snapshots and
/// write back through the repository.
pub struct Dispatcher {
    pub(crate) config: EngineConfig,
    pub(crate) queue: Arc<dyn QueueTransport>,
    pub(crate) repository: Arc<dyn ExecutionRepository>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) catalog: Arc<StageCatalog>,
    pub(crate) tasks: Arc<TaskRegistry>,
    pub(crate) admission: AdmissionController,
    pub(crate) retry: RetryPolicy,
    locks: Mutex<HashSet<Uuid>>,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn QueueTransport>,
        repository: Arc<dyn ExecutionRepository>,
        events: Arc<dyn EventPublisher>,
        catalog: Arc<StageCatalog>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        Self {
            config,
            queue,
            repository,
            events,
            catalog,
            tasks,
            admission: AdmissionController::new(),
            retry,
            locks: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Persist a fresh execution and enqueue its start.
    pub async fn submit(&self, execution: PipelineExecution) -> Result<Uuid, RepositoryError> {
        let id = execution.id;
        self.repository.store(&execution).await?;
        self.queue
            .push(Message::new(&execution, MessageKind::StartExecution))
            .await;
        info!(execution_id = %id, application = %execution.application, "execution submitted");
        Ok(id)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// The transport this dispatcher polls; embedding applications push
    /// operator commands (cancel, skip, restart) through it.
    pub fn queue(&self) -> Arc<dyn QueueTransport> {
        Arc::clone(&self.queue)
    }

    /// Spawn the configured number of worker tasks.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|_| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.run_worker().await })
            })
            .collect()
    }

    /// Poll the queue until shutdown, handling each delivery to completion.
    pub async fn run_worker(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.queue.poll().await {
                Some(delivery) => self.handle(delivery).await,
                None => tokio::time::sleep(self.config.poll_interval()).await,
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let message = delivery.message.clone();
        let delivery_attempts = self.queue.attempts(&delivery).await;
        let total_attempts = delivery_attempts.saturating_add(message.attempts);

        if self.retry.exhausted(total_attempts) {
            counter!("cascade.messages.exhausted").increment(1);
            warn!(
                kind = message.kind_name(),
                execution_id = %message.execution_id,
                attempts = total_attempts,
                "message exhausted its attempts; converting to invalid marker"
            );
            self.push_invalid(&message, "attempts ceiling exceeded").await;
            self.queue.ack(&delivery).await;
            return;
        }

        // advisory per-execution lock; a miss is a throughput event only
        if !self.try_lock(message.execution_id) {
            self.queue.nack(&delivery, LOCK_RETRY_DELAY).await;
            return;
        }
        let result =
            tokio::time::timeout(self.config.handler_timeout(), self.route(&message)).await;
        self.unlock(message.execution_id);

        match result {
            Err(_) => {
                warn!(
                    kind = message.kind_name(),
                    execution_id = %message.execution_id,
                    "handler exceeded its time budget; redelivering"
                );
                self.queue
                    .nack(&delivery, self.retry.delay(delivery_attempts))
                    .await;
            }
            Ok(Ok(())) => self.queue.ack(&delivery).await,
            Ok(Err(e)) if e.is_transient() => {
                counter!("cascade.messages.retried").increment(1);
                warn!(
                    kind = message.kind_name(),
                    execution_id = %message.execution_id,
                    error = %e,
                    "transient handler failure; redelivering"
                );
                self.queue
                    .nack(&delivery, self.retry.delay(delivery_attempts))
                    .await;
            }
            Ok(Err(e)) => {
                counter!("cascade.messages.invalid").increment(1);
                error!(
                    kind = message.kind_name(),
                    execution_id = %message.execution_id,
                    error = %e,
                    "malformed message"
                );
                self.push_invalid(&message, &e.to_string()).await;
                self.queue.ack(&delivery).await;
            }
        }
    }

    /// Emit the invalid marker matching the message's tier.
    async fn push_invalid(&self, message: &Message, reason: &str) {
        let payload = match (&message.payload, message.stage_id(), message.task_id()) {
            // a marker never begets another marker
            (
                MessageKind::InvalidExecution { .. }
                | MessageKind::InvalidStage { .. }
                | MessageKind::InvalidTask { .. },
                _,
                _,
            ) => {
                error!(execution_id = %message.execution_id, reason, "invalid marker could not be handled");
                return;
            }
            (_, Some(stage_id), Some(task_id)) => MessageKind::InvalidTask {
                stage_id,
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            },
            (_, Some(stage_id), None) => MessageKind::InvalidStage {
                stage_id,
                reason: reason.to_string(),
            },
            _ => MessageKind::InvalidExecution {
                reason: reason.to_string(),
            },
        };
        let mut marker = message.clone();
        marker.attempts = 0;
        marker.payload = payload;
        self.queue.push(marker).await;
    }

    async fn route(&self, message: &Message) -> Result<(), HandlerError> {
        let execution = self
            .repository
            .retrieve(message.execution_type, message.execution_id)
            .await?;

        // terminal executions absorb everything except an explicit restart,
        // waiting-queue bookkeeping, and side-effect cancellation pushed by
        // the finalization itself
        if execution.status.is_complete()
            && !matches!(
                message.payload,
                MessageKind::RestartStage { .. }
                    | MessageKind::StartWaitingExecutions { .. }
                    | MessageKind::CancelStage { .. }
            )
        {
            debug!(
                kind = message.kind_name(),
                execution_id = %execution.id,
                status = %execution.status,
                "ignoring message for completed execution"
            );
            return Ok(());
        }

        match message.payload.clone() {
            MessageKind::StartExecution => self.start_execution(execution, message).await,
            MessageKind::CompleteExecution => self.complete_execution(execution, message).await,
            MessageKind::CancelExecution { user, reason } => {
                self.cancel_execution(execution, message, user, reason).await
            }
            MessageKind::ResumeExecution => self.resume_execution(execution, message).await,
            MessageKind::RescheduleExecution => self.reschedule_execution(execution, message).await,
            MessageKind::StartWaitingExecutions {
                pipeline_config_id,
                purge_queue,
            } => {
                self.start_waiting_executions(message, &pipeline_config_id, purge_queue)
                    .await
            }

            MessageKind::StartStage { stage_id } => {
                self.start_stage(execution, message, stage_id).await
            }
            MessageKind::CompleteStage { stage_id } => {
                self.complete_stage(execution, message, stage_id).await
            }
            MessageKind::SkipStage { stage_id, user } => {
                self.skip_stage(execution, message, stage_id, user).await
            }
            MessageKind::AbortStage { stage_id } => {
                self.abort_stage(execution, message, stage_id).await
            }
            MessageKind::CancelStage { stage_id } => self.cancel_stage(execution, stage_id).await,
            MessageKind::RestartStage { stage_id, user } => {
                self.restart_stage(execution, message, stage_id, user).await
            }
            MessageKind::PauseStage { stage_id } => {
                self.pause_stage(execution, message, stage_id).await
            }
            MessageKind::ResumeStage { stage_id } => {
                self.resume_stage(execution, message, stage_id).await
            }
            MessageKind::ContinueParentStage { stage_id } => {
                self.continue_parent_stage(execution, message, stage_id).await
            }

            MessageKind::StartTask { stage_id, task_id } => {
                self.start_task(execution, message, stage_id, &task_id).await
            }
            MessageKind::RunTask { stage_id, task_id } => {
                self.run_task(execution, message, stage_id, &task_id).await
            }
            MessageKind::CompleteTask {
                stage_id,
                task_id,
                status,
                original_status,
            } => {
                self.complete_task(execution, message, stage_id, &task_id, status, original_status)
                    .await
            }
            MessageKind::PauseTask { stage_id, task_id } => {
                self.pause_task(execution, stage_id, &task_id).await
            }
            MessageKind::ResumeTask { stage_id, task_id } => {
                self.resume_task(execution, message, stage_id, &task_id).await
            }

            MessageKind::InvalidExecution { reason } => {
                self.invalid_execution(execution, message, &reason).await
            }
            MessageKind::InvalidStage { stage_id, reason } => {
                self.invalid_stage(execution, message, stage_id, &reason).await
            }
            MessageKind::InvalidTask {
                stage_id,
                task_id,
                reason,
            } => {
                self.invalid_task(execution, message, stage_id, &task_id, &reason)
                    .await
            }
        }
    }

    fn try_lock(&self, execution_id: Uuid) -> bool {
        self.locks.lock().unwrap().insert(execution_id)
    }

    fn unlock(&self, execution_id: Uuid) {
        self.locks.lock().unwrap().remove(&execution_id);
    }

    /// Push a follow-on message for immediate delivery.
    pub(crate) async fn push(&self, message: Message) {
        self.queue.push(message).await;
    }

    /// Re-queue `message` itself after the policy delay, bumping its
    /// redelivery counter so livelocks eventually exhaust.
    pub(crate) async fn requeue(&self, message: &Message) {
        let requeued = message.requeued();
        let delay = self.retry.delay(requeued.attempts);
        self.queue.push_delayed(requeued, delay).await;
    }
}
