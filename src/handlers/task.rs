//! Task handlers: drive a single task through its lifecycle

use crate::core::model::PipelineExecution;
use crate::core::status::ExecutionStatus;
use crate::events::Event;
use crate::handlers::{Dispatcher, HandlerError};
use crate::queue::{Message, MessageKind};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

impl Dispatcher {
    pub(crate) async fn start_task(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id_mut(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;
        let task = stage
            .task_by_id_mut(task_id)
            .ok_or_else(|| HandlerError::TaskNotFound {
                stage_id,
                task_id: task_id.to_string(),
            })?;

        if task.status.is_complete() || task.status == ExecutionStatus::Running {
            debug!(task = %task.name, status = %task.status, "task already started");
            return Ok(());
        }

        task.status = ExecutionStatus::Running;
        if task.start_time.is_none() {
            task.start_time = Some(Utc::now());
        }
        let task_snapshot = task.clone();
        let stage_snapshot = stage.clone();

        self.repository.store_stage(&stage_snapshot).await?;
        self.events
            .publish(Event::TaskStarted {
                stage: stage_snapshot,
                task: task_snapshot,
            })
            .await;
        self.push(Message::new(
            &execution,
            MessageKind::RunTask {
                stage_id,
                task_id: task_id.to_string(),
            },
        ))
        .await;
        Ok(())
    }

    pub(crate) async fn run_task(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?
            .clone();
        let task = stage
            .task_by_id(task_id)
            .ok_or_else(|| HandlerError::TaskNotFound {
                stage_id,
                task_id: task_id.to_string(),
            })?
            .clone();

        match task.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Paused => {
                debug!(task = %task.name, "task is paused; awaiting resume");
                return Ok(());
            }
            status if status.is_complete() => {
                debug!(task = %task.name, %status, "task already complete");
                return Ok(());
            }
            status => {
                warn!(task = %task.name, %status, "RunTask for a task that was never started");
                return Ok(());
            }
        }

        // cancellation is observed here, on each delivery; the task loop
        // converges through the normal completion path
        if execution.canceled {
            self.push_complete_task(&execution, stage_id, task_id, ExecutionStatus::Canceled, None)
                .await;
            return Ok(());
        }

        if execution.paused {
            self.push(Message::new(
                &execution,
                MessageKind::PauseTask {
                    stage_id,
                    task_id: task_id.to_string(),
                },
            ))
            .await;
            return Ok(());
        }

        let task_impl = match self.tasks.get(&task.implementing_type) {
            Some(t) => t,
            None => {
                warn!(
                    implementing_type = %task.implementing_type,
                    "no task implementation registered"
                );
                let mut stage = stage.clone();
                stage.set_failure_reason(&format!(
                    "No task implementation registered for '{}'",
                    task.implementing_type
                ));
                self.repository.update_stage_context(&stage).await?;
                self.push_complete_task(
                    &execution,
                    stage_id,
                    task_id,
                    ExecutionStatus::Terminal,
                    None,
                )
                .await;
                return Ok(());
            }
        };

        // wall-clock deadline; the returned-context extension is the only
        // permitted write to it
        if let Some(started) = task.start_time {
            let budget = chrono::Duration::from_std(task_impl.timeout())
                .unwrap_or_else(|_| chrono::Duration::days(365))
                + chrono::Duration::milliseconds(stage.task_timeout_extension_ms());
            if Utc::now().signed_duration_since(started) > budget {
                let mut stage = stage.clone();
                stage.set_failure_reason(&format!(
                    "Task '{}' timed out after {}s",
                    task.name,
                    task_impl.timeout().as_secs()
                ));
                self.repository.update_stage_context(&stage).await?;
                self.push_complete_task(
                    &execution,
                    stage_id,
                    task_id,
                    ExecutionStatus::Terminal,
                    None,
                )
                .await;
                return Ok(());
            }
        }

        let result = match task_impl.execute(&stage).await {
            Ok(result) => result,
            Err(e) => {
                let mut stage = stage.clone();
                stage.set_failure_reason(&e.to_string());
                self.repository.update_stage_context(&stage).await?;
                self.push_complete_task(
                    &execution,
                    stage_id,
                    task_id,
                    ExecutionStatus::Terminal,
                    None,
                )
                .await;
                return Ok(());
            }
        };

        if !result.context.is_empty() || !result.outputs.is_empty() {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            stage.merge_context(&result.context);
            stage.merge_outputs(&result.outputs);
            let snapshot = stage.clone();
            self.repository.update_stage_context(&snapshot).await?;
        }

        match result.status {
            ExecutionStatus::Running => {
                self.queue
                    .push_delayed(
                        Message::new(
                            &execution,
                            MessageKind::RunTask {
                                stage_id,
                                task_id: task_id.to_string(),
                            },
                        ),
                        task_impl.backoff_period(),
                    )
                    .await;
            }
            ExecutionStatus::Succeeded
            | ExecutionStatus::Skipped
            | ExecutionStatus::FailedContinue
            | ExecutionStatus::Canceled
            | ExecutionStatus::Stopped => {
                self.push_complete_task(&execution, stage_id, task_id, result.status, None)
                    .await;
            }
            ExecutionStatus::Terminal => {
                let stage = execution.stage_by_id(stage_id).expect("stage disappeared");
                if stage.continue_on_failure() {
                    self.push_complete_task(
                        &execution,
                        stage_id,
                        task_id,
                        ExecutionStatus::FailedContinue,
                        Some(ExecutionStatus::Terminal),
                    )
                    .await;
                } else {
                    self.push_complete_task(
                        &execution,
                        stage_id,
                        task_id,
                        ExecutionStatus::Terminal,
                        None,
                    )
                    .await;
                }
            }
            ExecutionStatus::Redirect => {
                self.redirect(&mut execution, message, stage_id, task_id).await?;
            }
            ExecutionStatus::Paused => {
                let stage = execution
                    .stage_by_id_mut(stage_id)
                    .expect("stage disappeared");
                if let Some(task) = stage.task_by_id_mut(task_id) {
                    task.status = ExecutionStatus::Paused;
                }
                let snapshot = stage.clone();
                self.repository.store_stage(&snapshot).await?;
            }
            other => {
                warn!(task = %task.name, status = %other, "task returned a nonsensical status");
                self.push_complete_task(
                    &execution,
                    stage_id,
                    task_id,
                    ExecutionStatus::Terminal,
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    /// REDIRECT: reset the loop range to NOT_STARTED and restart its head.
    /// The REDIRECT status itself is never persisted.
    async fn redirect(
        &self,
        execution: &mut PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id_mut(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;

        let current = stage
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| HandlerError::TaskNotFound {
                stage_id,
                task_id: task_id.to_string(),
            })?;
        let head = stage.tasks[..=current].iter().rposition(|t| t.loop_start);

        let head = match head {
            Some(index) => index,
            None => {
                warn!(stage = %stage.name, "REDIRECT without a loopStart task");
                stage.set_failure_reason("REDIRECT returned by a stage with no loopStart task");
                let snapshot = stage.clone();
                self.repository.update_stage_context(&snapshot).await?;
                self.push_complete_task(
                    execution,
                    stage_id,
                    task_id,
                    ExecutionStatus::Terminal,
                    None,
                )
                .await;
                return Ok(());
            }
        };

        for task in &mut stage.tasks[head..=current] {
            task.status = ExecutionStatus::NotStarted;
            task.start_time = None;
            task.end_time = None;
        }
        let head_id = stage.tasks[head].id.clone();
        let snapshot = stage.clone();
        self.repository.store_stage(&snapshot).await?;

        self.push(Message::new(
            execution,
            MessageKind::StartTask {
                stage_id,
                task_id: head_id,
            },
        ))
        .await;
        Ok(())
    }

    async fn push_complete_task(
        &self,
        execution: &PipelineExecution,
        stage_id: Uuid,
        task_id: &str,
        status: ExecutionStatus,
        original_status: Option<ExecutionStatus>,
    ) {
        self.push(Message::new(
            execution,
            MessageKind::CompleteTask {
                stage_id,
                task_id: task_id.to_string(),
                status,
                original_status,
            },
        ))
        .await;
    }

    pub(crate) async fn complete_task(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        task_id: &str,
        status: ExecutionStatus,
        original_status: Option<ExecutionStatus>,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id_mut(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;
        let task = stage
            .task_by_id_mut(task_id)
            .ok_or_else(|| HandlerError::TaskNotFound {
                stage_id,
                task_id: task_id.to_string(),
            })?;

        // re-applying the same completion is a no-op state-wise; the
        // follow-on messages are re-pushed and collapse in the queue
        let already_applied = task.status == status && task.end_time.is_some();
        if !already_applied {
            task.status = status;
            if task.end_time.is_none() {
                task.end_time = Some(Utc::now());
            }
            let task_snapshot = task.clone();
            if let Some(original) = original_status {
                stage.context.insert(
                    format!("task.{}.originalStatus", task_id),
                    serde_json::Value::String(original.to_string()),
                );
            }
            let stage_snapshot = stage.clone();
            self.repository.store_stage(&stage_snapshot).await?;
            self.events
                .publish(Event::TaskComplete {
                    stage: stage_snapshot,
                    task: task_snapshot,
                })
                .await;
        }

        let stage = execution.stage_by_id(stage_id).expect("stage disappeared");
        let task = stage.task_by_id(task_id).expect("task disappeared");
        if status.is_successful() && !task.stage_end {
            if let Some(next) = stage.next_task_after(task_id) {
                let next_id = next.id.clone();
                self.push(Message::new(
                    &execution,
                    MessageKind::StartTask {
                        stage_id,
                        task_id: next_id,
                    },
                ))
                .await;
                return Ok(());
            }
        }
        self.push(Message::new(
            &execution,
            MessageKind::CompleteStage { stage_id },
        ))
        .await;
        Ok(())
    }

    pub(crate) async fn pause_task(
        &self,
        mut execution: PipelineExecution,
        stage_id: Uuid,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let execution_id = execution.id;
        let stage = execution
            .stage_by_id_mut(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id,
                stage_id,
            })?;
        if let Some(task) = stage.task_by_id_mut(task_id) {
            if task.status == ExecutionStatus::Running {
                task.status = ExecutionStatus::Paused;
                stage.status = ExecutionStatus::Paused;
                let snapshot = stage.clone();
                self.repository.store_stage(&snapshot).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn resume_task(
        &self,
        mut execution: PipelineExecution,
        _message: &Message,
        stage_id: Uuid,
        task_id: &str,
    ) -> Result<(), HandlerError> {
        let execution_id = execution.id;
        let stage = execution
            .stage_by_id_mut(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id,
                stage_id,
            })?;
        let resumed = match stage.task_by_id_mut(task_id) {
            Some(task) if task.status == ExecutionStatus::Paused => {
                task.status = ExecutionStatus::Running;
                true
            }
            _ => false,
        };
        if resumed {
            if stage.status == ExecutionStatus::Paused {
                stage.status = ExecutionStatus::Running;
            }
            let snapshot = stage.clone();
            self.repository.store_stage(&snapshot).await?;
            self.push(Message::new(
                &execution,
                MessageKind::RunTask {
                    stage_id,
                    task_id: task_id.to_string(),
                },
            ))
            .await;
        }
        Ok(())
    }

    pub(crate) async fn invalid_task(
        &self,
        mut execution: PipelineExecution,
        _message: &Message,
        stage_id: Uuid,
        task_id: &str,
        reason: &str,
    ) -> Result<(), HandlerError> {
        if let Some(stage) = execution.stage_by_id_mut(stage_id) {
            if let Some(task) = stage.task_by_id_mut(task_id) {
                if !task.status.is_complete() {
                    task.status = ExecutionStatus::Terminal;
                    task.end_time = Some(Utc::now());
                }
            }
            if !stage.status.is_complete() {
                stage.status = ExecutionStatus::Terminal;
                stage.end_time = Some(Utc::now());
                stage.set_failure_reason(reason);
            }
            let snapshot = stage.clone();
            self.repository.store_stage(&snapshot).await?;
        }
        self.force_complete(execution, reason).await
    }
}
