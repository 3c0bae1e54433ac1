//! Stage handlers: stage lifecycle and downstream scheduling

use crate::core::model::{PipelineExecution, StageExecution, SyntheticStageOwner};
use crate::core::status::{fold_statuses, ExecutionStatus};
use crate::events::Event;
use crate::handlers::{expand, Dispatcher, HandlerError};
use crate::queue::{Message, MessageKind};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Dispatcher {
    pub(crate) async fn start_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?
            .clone();

        if stage.status.is_complete() || stage.status == ExecutionStatus::Running {
            debug!(stage = %stage.name, status = %stage.status, "stage already started");
            return Ok(());
        }

        if execution.canceled {
            // downstream work of a canceled execution never starts; nudge
            // the drain instead
            self.push(Message::new(&execution, MessageKind::CompleteExecution))
                .await;
            return Ok(());
        }

        let builder = match self.catalog.get(&stage.stage_type) {
            Some(builder) => builder,
            None => {
                warn!(stage_type = %stage.stage_type, "no builder registered for stage type");
                let stage = {
                    let stage = execution
                        .stage_by_id_mut(stage_id)
                        .expect("stage disappeared");
                    stage.status = ExecutionStatus::Terminal;
                    stage.end_time = Some(Utc::now());
                    stage.set_failure_reason(&format!(
                        "No builder registered for stage type '{}'",
                        stage.stage_type
                    ));
                    stage.clone()
                };
                self.repository.store_stage(&stage).await?;
                self.events
                    .publish(Event::StageComplete {
                        stage: stage.clone(),
                    })
                    .await;
                self.propagate_completion(&execution, &stage).await;
                return Ok(());
            }
        };

        expand::expand_stage(&mut execution, stage_id, builder.as_ref());
        {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            stage.status = ExecutionStatus::Running;
            stage.start_time = Some(Utc::now());
        }
        // persist the expanded shape atomically so a restart observes it
        self.repository.store(&execution).await?;

        let stage = execution.stage_by_id(stage_id).expect("stage disappeared");
        self.events
            .publish(Event::StageStarted {
                stage: stage.clone(),
            })
            .await;

        let before_roots: Vec<Uuid> =
            expand::group_roots(execution.before_children(stage_id))
                .into_iter()
                .map(|s| s.id)
                .collect();
        if !before_roots.is_empty() {
            for root in before_roots {
                self.push(Message::new(&execution, MessageKind::StartStage { stage_id: root }))
                    .await;
            }
        } else if let Some(first) = stage.first_task() {
            let task_id = first.id.clone();
            self.push(Message::new(
                &execution,
                MessageKind::StartTask { stage_id, task_id },
            ))
            .await;
        } else {
            self.push(Message::new(&execution, MessageKind::CompleteStage { stage_id }))
                .await;
        }
        Ok(())
    }

    /// A completed before-group hands control back to the parent's own
    /// tasks.
    pub(crate) async fn continue_parent_stage(
        &self,
        execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let parent = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;

        if parent
            .tasks
            .iter()
            .any(|t| t.status != ExecutionStatus::NotStarted)
        {
            debug!(stage = %parent.name, "parent already progressed past its before-group");
            return Ok(());
        }

        match parent.first_task() {
            Some(first) => {
                let task_id = first.id.clone();
                self.push(Message::new(
                    &execution,
                    MessageKind::StartTask { stage_id, task_id },
                ))
                .await;
            }
            None => {
                self.push(Message::new(&execution, MessageKind::CompleteStage { stage_id }))
                    .await;
            }
        }
        Ok(())
    }

    pub(crate) async fn complete_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?
            .clone();

        // redelivery after a finalizing crash: re-run the propagation,
        // the pushes collapse in the queue
        if stage.status.is_complete() {
            self.propagate_completion(&execution, &stage).await;
            return Ok(());
        }

        let children: Vec<StageExecution> =
            execution.synthetic_children(stage_id).cloned().collect();
        let started: Vec<&StageExecution> = children
            .iter()
            .filter(|c| c.status != ExecutionStatus::NotStarted)
            .collect();

        // a failed synthetic child fails the parent, but only once the
        // rest of the brood has settled
        let child_halt = started
            .iter()
            .map(|c| c.status)
            .filter(|s| s.is_halt())
            .max_by_key(|s| halt_rank(*s));
        let children_in_play = children.iter().any(|c| {
            matches!(c.status, ExecutionStatus::Running | ExecutionStatus::Paused)
                || (c.status == ExecutionStatus::NotStarted
                    && !children.is_empty()
                    && started.iter().any(|s| s.ref_id != c.ref_id)
                    && execution.upstreams_complete(c))
        });

        if let Some(halt) = child_halt {
            if started.iter().any(|c| !c.status.is_complete()) {
                for child in &children {
                    if child.status == ExecutionStatus::Running {
                        self.push(Message::new(
                            &execution,
                            MessageKind::CancelStage { stage_id: child.id },
                        ))
                        .await;
                    }
                }
                self.requeue(message).await;
                return Ok(());
            }
            return self.finalize_stage(&mut execution, stage_id, halt).await;
        }

        if started.iter().any(|c| !c.status.is_complete()) || children_in_play {
            self.requeue(message).await;
            return Ok(());
        }

        let task_status = fold_statuses(stage.tasks.iter().map(|t| t.status));
        if !task_status.is_complete() {
            self.requeue(message).await;
            return Ok(());
        }
        if task_status.is_halt() {
            return self.finalize_stage(&mut execution, stage_id, task_status).await;
        }

        // tasks succeeded: after-stages run before the stage completes
        let after: Vec<&StageExecution> = execution.after_children(stage_id).collect();
        if !after.is_empty() && after.iter().all(|c| c.status == ExecutionStatus::NotStarted) {
            let roots: Vec<Uuid> = expand::group_roots(after.into_iter())
                .into_iter()
                .map(|s| s.id)
                .collect();
            for root in roots {
                self.push(Message::new(&execution, MessageKind::StartStage { stage_id: root }))
                    .await;
            }
            self.requeue(message).await;
            return Ok(());
        }

        let mut final_status = task_status;
        if final_status == ExecutionStatus::Succeeded
            && children
                .iter()
                .any(|c| c.status == ExecutionStatus::FailedContinue)
        {
            final_status = ExecutionStatus::FailedContinue;
        }
        self.finalize_stage(&mut execution, stage_id, final_status).await
    }

    /// Record the stage's terminal status, publish, and schedule whatever
    /// comes next.
    async fn finalize_stage(
        &self,
        execution: &mut PipelineExecution,
        stage_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), HandlerError> {
        let stage = {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            if !stage.status.is_complete() {
                stage.status = status;
                if stage.end_time.is_none() {
                    stage.end_time = Some(Utc::now());
                }
            }
            stage.clone()
        };
        self.repository.store_stage(&stage).await?;
        info!(stage = %stage.name, status = %stage.status, "stage complete");
        self.events
            .publish(Event::StageComplete {
                stage: stage.clone(),
            })
            .await;
        self.propagate_completion(execution, &stage).await;
        Ok(())
    }

    /// Downstream effects of a completed stage: sibling starts, parent
    /// continuation, execution completion, branch cancellation.
    async fn propagate_completion(&self, execution: &PipelineExecution, stage: &StageExecution) {
        let status = stage.status;

        if let (Some(parent_id), Some(owner)) =
            (stage.parent_stage_id, stage.synthetic_stage_owner)
        {
            if status.is_successful() {
                self.start_eligible_downstream(execution, stage).await;
                match owner {
                    SyntheticStageOwner::StageBefore => {
                        if execution
                            .before_children(parent_id)
                            .all(|c| c.status.is_successful())
                        {
                            self.push(Message::new(
                                execution,
                                MessageKind::ContinueParentStage { stage_id: parent_id },
                            ))
                            .await;
                        }
                    }
                    SyntheticStageOwner::StageAfter => {
                        if execution
                            .after_children(parent_id)
                            .all(|c| c.status.is_complete())
                        {
                            self.push(Message::new(
                                execution,
                                MessageKind::CompleteStage { stage_id: parent_id },
                            ))
                            .await;
                        }
                    }
                }
            } else {
                self.push(Message::new(
                    execution,
                    MessageKind::CompleteStage { stage_id: parent_id },
                ))
                .await;
            }
            return;
        }

        match status {
            s if s.is_successful() => {
                let has_downstream = execution.downstream_of(&stage.ref_id).next().is_some();
                if has_downstream {
                    self.start_eligible_downstream(execution, stage).await;
                } else {
                    self.push(Message::new(execution, MessageKind::CompleteExecution))
                        .await;
                }
            }
            ExecutionStatus::Stopped => {
                // the branch halts quietly; the final status is derived at
                // execution completion
                self.push(Message::new(execution, MessageKind::CompleteExecution))
                    .await;
            }
            ExecutionStatus::Terminal | ExecutionStatus::Canceled => {
                if !stage.complete_other_branches_then_fail() {
                    for sibling in execution.top_level_stages() {
                        if sibling.id != stage.id && sibling.status == ExecutionStatus::Running {
                            self.push(Message::new(
                                execution,
                                MessageKind::CancelStage { stage_id: sibling.id },
                            ))
                            .await;
                        }
                    }
                }
                self.push(Message::new(execution, MessageKind::CompleteExecution))
                    .await;
            }
            _ => {}
        }
    }

    /// StartStage for each downstream stage whose upstreams are all done.
    /// Messages go out in definition order; the queue itself guarantees
    /// nothing, so downstream handlers stay commutative.
    async fn start_eligible_downstream(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
    ) {
        let eligible: Vec<Uuid> = execution
            .downstream_of(&stage.ref_id)
            .filter(|d| {
                d.status == ExecutionStatus::NotStarted && execution.upstreams_complete(d)
            })
            .map(|d| d.id)
            .collect();
        for stage_id in eligible {
            self.push(Message::new(execution, MessageKind::StartStage { stage_id }))
                .await;
        }
    }

    /// Manual skip: records SKIPPED but schedules downstream exactly as
    /// SUCCEEDED would.
    pub(crate) async fn skip_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        user: Option<String>,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;

        let allowed = stage.manual_skip_enabled()
            || self
                .catalog
                .get(&stage.stage_type)
                .map(|b| b.can_manually_skip(stage))
                .unwrap_or(false);
        if stage.status != ExecutionStatus::Running || !allowed {
            warn!(
                stage = %stage.name,
                status = %stage.status,
                allowed,
                "ignoring skip request"
            );
            return Ok(());
        }

        {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            if let Some(user) = user {
                stage.last_modified = Some(crate::core::model::LastModified {
                    user,
                    allowed_accounts: Vec::new(),
                    last_modified_time: Utc::now(),
                });
            }
        }
        self.finalize_stage(&mut execution, stage_id, ExecutionStatus::Skipped)
            .await
    }

    /// Forced abort: TERMINAL immediately, then side-effect cancellation
    /// and completion of whatever encloses the stage.
    pub(crate) async fn abort_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?
            .clone();
        if stage.status.is_complete() {
            return Ok(());
        }

        let stage = {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            stage.status = ExecutionStatus::Terminal;
            stage.end_time = Some(Utc::now());
            stage.set_failure_reason("Stage was aborted");
            stage.clone()
        };
        self.repository.store_stage(&stage).await?;
        self.events
            .publish(Event::StageComplete {
                stage: stage.clone(),
            })
            .await;

        self.push(Message::new(&execution, MessageKind::CancelStage { stage_id }))
            .await;
        match stage.parent_stage_id {
            Some(parent_id) => {
                self.push(Message::new(
                    &execution,
                    MessageKind::CompleteStage { stage_id: parent_id },
                ))
                .await;
            }
            None => {
                self.push(Message::new(&execution, MessageKind::CompleteExecution))
                    .await;
            }
        }
        Ok(())
    }

    /// Side-effect cancellation. No queue effects; state transitions are
    /// driven by the task loop and CompleteStage.
    pub(crate) async fn cancel_stage(
        &self,
        execution: PipelineExecution,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: execution.id,
                stage_id,
            })?;

        let builder = match self.catalog.get(&stage.stage_type) {
            Some(b) if b.cancellable() => b,
            _ => return Ok(()),
        };
        // never for stages that haven't run: there is nothing cloud-side
        // to abort yet
        if !matches!(
            stage.status,
            ExecutionStatus::Running | ExecutionStatus::Canceled | ExecutionStatus::Terminal
        ) {
            return Ok(());
        }

        info!(stage = %stage.name, "invoking cancel hook");
        builder.cancel(stage).await;
        Ok(())
    }

    /// Re-run a completed stage and everything downstream of it.
    pub(crate) async fn restart_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
        user: Option<String>,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?
            .clone();
        if !stage.status.is_complete() {
            warn!(stage = %stage.name, status = %stage.status, "only completed stages restart");
            return Ok(());
        }

        // transitive downstream of the restarted stage, by refId
        let mut to_reset: Vec<Uuid> = vec![stage_id];
        let mut frontier = vec![stage.ref_id.clone()];
        while let Some(ref_id) = frontier.pop() {
            for downstream in execution.downstream_of(&ref_id) {
                if !to_reset.contains(&downstream.id) {
                    to_reset.push(downstream.id);
                    frontier.push(downstream.ref_id.clone());
                }
            }
        }

        // synthetic descendants are dropped, grandchildren included; they
        // re-expand on start
        let mut doomed: Vec<Uuid> = to_reset.clone();
        loop {
            let more: Vec<Uuid> = execution
                .stages
                .iter()
                .filter(|s| {
                    s.parent_stage_id.map(|p| doomed.contains(&p)).unwrap_or(false)
                        && !doomed.contains(&s.id)
                })
                .map(|s| s.id)
                .collect();
            if more.is_empty() {
                break;
            }
            doomed.extend(more);
        }
        execution.stages.retain(|s| {
            s.parent_stage_id.is_none() || to_reset.contains(&s.id) || !doomed.contains(&s.id)
        });
        for id in &to_reset {
            if let Some(stage) = execution.stage_by_id_mut(*id) {
                if let Some(builder) = self.catalog.get(&stage.stage_type) {
                    builder.prepare_for_restart(stage);
                }
                stage.status = ExecutionStatus::NotStarted;
                stage.start_time = None;
                stage.end_time = None;
                stage.tasks.clear();
                stage.context.remove("reason");
            }
        }
        if let Some(stage) = execution.stage_by_id_mut(stage_id) {
            if let Some(user) = user {
                stage.last_modified = Some(crate::core::model::LastModified {
                    user,
                    allowed_accounts: Vec::new(),
                    last_modified_time: Utc::now(),
                });
            }
        }

        execution.status = ExecutionStatus::Running;
        execution.end_time = None;
        execution.canceled = false;
        execution.canceled_by = None;
        execution.cancellation_reason = None;
        self.repository.store(&execution).await?;

        self.push(Message::new(&execution, MessageKind::StartStage { stage_id }))
            .await;
        Ok(())
    }

    pub(crate) async fn pause_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;
        if stage.status != ExecutionStatus::Running {
            return Ok(());
        }

        let running_task = stage
            .tasks
            .iter()
            .find(|t| t.status == ExecutionStatus::Running)
            .map(|t| t.id.clone());
        match running_task {
            Some(task_id) => {
                self.push(Message::new(
                    &execution,
                    MessageKind::PauseTask { stage_id, task_id },
                ))
                .await;
            }
            None => {
                let stage = execution
                    .stage_by_id_mut(stage_id)
                    .expect("stage disappeared");
                stage.status = ExecutionStatus::Paused;
                let snapshot = stage.clone();
                self.repository.store_stage(&snapshot).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn resume_stage(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
        stage_id: Uuid,
    ) -> Result<(), HandlerError> {
        let stage = execution
            .stage_by_id(stage_id)
            .ok_or(HandlerError::StageNotFound {
                execution_id: message.execution_id,
                stage_id,
            })?;
        if stage.status != ExecutionStatus::Paused {
            return Ok(());
        }

        let paused_tasks: Vec<String> = stage
            .tasks
            .iter()
            .filter(|t| t.status == ExecutionStatus::Paused)
            .map(|t| t.id.clone())
            .collect();
        {
            let stage = execution
                .stage_by_id_mut(stage_id)
                .expect("stage disappeared");
            stage.status = ExecutionStatus::Running;
            let snapshot = stage.clone();
            self.repository.store_stage(&snapshot).await?;
        }
        for task_id in paused_tasks {
            self.push(Message::new(
                &execution,
                MessageKind::ResumeTask { stage_id, task_id },
            ))
            .await;
        }
        Ok(())
    }

    pub(crate) async fn invalid_stage(
        &self,
        mut execution: PipelineExecution,
        _message: &Message,
        stage_id: Uuid,
        reason: &str,
    ) -> Result<(), HandlerError> {
        if let Some(stage) = execution.stage_by_id_mut(stage_id) {
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

fn halt_rank(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::Terminal => 3,
        ExecutionStatus::Canceled => 2,
        ExecutionStatus::Stopped => 1,
        _ => 0,
    }
}
