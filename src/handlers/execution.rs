//! Execution handlers: top-level lifecycle and concurrency admission

use crate::core::model::PipelineExecution;
use crate::core::status::ExecutionStatus;
use crate::events::Event;
use crate::handlers::{Dispatcher, HandlerError};
use crate::queue::{Message, MessageKind};
use chrono::Utc;
use tracing::{debug, info, warn};

impl Dispatcher {
    pub(crate) async fn start_execution(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
    ) -> Result<(), HandlerError> {
        if execution.status != ExecutionStatus::NotStarted {
            debug!(execution_id = %execution.id, status = %execution.status, "execution already started");
            return Ok(());
        }

        if execution.canceled {
            self.push(Message::new(&execution, MessageKind::CompleteExecution))
                .await;
            return Ok(());
        }

        // a cycle should have been rejected at submission; if one slips
        // through we fail the execution rather than hang it
        if execution.has_cycle() {
            warn!(execution_id = %execution.id, "dependency cycle detected");
            execution.status = ExecutionStatus::Running;
            execution.start_time = Some(Utc::now());
            self.events
                .publish(Event::ExecutionStarted {
                    execution: execution.clone(),
                })
                .await;
            return self
                .force_complete(execution, "Pipeline contains a dependency cycle")
                .await;
        }

        // admission: one running execution per pipeline config
        if execution.limit_concurrent {
            if let Some(config_id) = execution.pipeline_config_id.clone() {
                if !self.admit(&execution, &config_id).await? {
                    info!(
                        execution_id = %execution.id,
                        pipeline_config_id = %config_id,
                        "another execution is running; keeping this one waiting"
                    );
                    return Ok(());
                }
            }
        }

        execution.status = ExecutionStatus::Running;
        execution.start_time = Some(Utc::now());
        self.repository.update_status(&execution).await?;
        self.events
            .publish(Event::ExecutionStarted {
                execution: execution.clone(),
            })
            .await;

        let initial: Vec<_> = execution.initial_stages().map(|s| s.id).collect();
        if initial.is_empty() {
            // nothing to run; converge immediately
            self.push(Message::new(&execution, MessageKind::CompleteExecution))
                .await;
        } else {
            for stage_id in initial {
                self.push(Message::new(&execution, MessageKind::StartStage { stage_id }))
                    .await;
            }
        }
        Ok(())
    }

    /// Claim the running slot for this config, verifying the repository
    /// on first contact so restarts do not double-admit.
    async fn admit(
        &self,
        execution: &PipelineExecution,
        config_id: &str,
    ) -> Result<bool, HandlerError> {
        if self.admission.running(config_id).is_none() {
            let peers = self.repository.retrieve_for_config(config_id).await?;
            if let Some(runner) = peers
                .iter()
                .find(|p| p.status == ExecutionStatus::Running && p.id != execution.id)
            {
                self.admission.record_running(config_id, runner.id);
            }
        }
        Ok(self.admission.try_acquire(config_id, execution.id))
    }

    pub(crate) async fn complete_execution(
        &self,
        mut execution: PipelineExecution,
        message: &Message,
    ) -> Result<(), HandlerError> {
        if execution.status.is_complete() {
            return Ok(());
        }

        // a top-level stage is still in play if it runs now or is due to
        // run: NOT_STARTED with every upstream complete and the execution
        // not canceled
        let in_play = execution.top_level_stages().any(|stage| {
            matches!(
                stage.status,
                ExecutionStatus::Running | ExecutionStatus::Paused
            ) || (stage.status == ExecutionStatus::NotStarted
                && !execution.canceled
                && execution.upstreams_complete(stage))
        });
        if in_play {
            self.requeue(message).await;
            return Ok(());
        }

        let statuses: Vec<(ExecutionStatus, bool)> = execution
            .top_level_stages()
            .map(|s| (s.status, s.complete_other_branches_then_fail()))
            .collect();
        let any_terminal = statuses
            .iter()
            .any(|(s, _)| *s == ExecutionStatus::Terminal);
        let stopped_fails = statuses
            .iter()
            .any(|(s, flag)| *s == ExecutionStatus::Stopped && *flag);
        let any_canceled = statuses
            .iter()
            .any(|(s, _)| *s == ExecutionStatus::Canceled);

        let final_status = if any_terminal || stopped_fails {
            ExecutionStatus::Terminal
        } else if any_canceled || execution.canceled {
            ExecutionStatus::Canceled
        } else {
            ExecutionStatus::Succeeded
        };

        execution.status = final_status;
        execution.end_time = Some(Utc::now());

        // a canceled execution finalizes with no stage left NOT_STARTED:
        // stages that never ran are recorded CANCELED, without invoking
        // any cancel hook (there is nothing cloud-side to abort)
        let mut stages_changed = false;
        if execution.canceled {
            let now = Utc::now();
            for stage in &mut execution.stages {
                if stage.status == ExecutionStatus::NotStarted {
                    stage.status = ExecutionStatus::Canceled;
                    stage.end_time = Some(now);
                    stages_changed = true;
                }
            }
        }
        if stages_changed {
            self.repository.store(&execution).await?;
        } else {
            self.repository.update_status(&execution).await?;
        }
        info!(execution_id = %execution.id, status = %final_status, "execution complete");

        if final_status != ExecutionStatus::Succeeded {
            let running: Vec<_> = execution
                .top_level_stages()
                .filter(|s| s.status == ExecutionStatus::Running)
                .map(|s| s.id)
                .collect();
            for stage_id in running {
                self.push(Message::new(&execution, MessageKind::CancelStage { stage_id }))
                    .await;
            }
        }

        self.events
            .publish(Event::ExecutionComplete {
                execution: execution.clone(),
            })
            .await;

        if let Some(config_id) = execution.pipeline_config_id.clone() {
            self.admission.release(&config_id, execution.id);
            self.push(Message::new(
                &execution,
                MessageKind::StartWaitingExecutions {
                    pipeline_config_id: config_id,
                    purge_queue: !execution.keep_waiting_pipelines,
                },
            ))
            .await;
        }
        Ok(())
    }

    /// Top-level abort. Cancels running stages and lets the normal drain
    /// converge; the execution reaches CANCELED only once every stage is
    /// terminal.
    pub(crate) async fn cancel_execution(
        &self,
        mut execution: PipelineExecution,
        _message: &Message,
        user: Option<String>,
        reason: Option<String>,
    ) -> Result<(), HandlerError> {
        execution.canceled = true;
        execution.canceled_by = user;
        execution.cancellation_reason = reason;
        self.repository.update_status(&execution).await?;
        info!(execution_id = %execution.id, "execution canceled");

        let running: Vec<_> = execution
            .top_level_stages()
            .filter(|s| s.status == ExecutionStatus::Running)
            .map(|s| s.id)
            .collect();
        for stage_id in running {
            self.push(Message::new(&execution, MessageKind::CancelStage { stage_id }))
                .await;
        }
        // nudge in-flight task loops so they observe the cancellation
        self.push(Message::new(&execution, MessageKind::RescheduleExecution))
            .await;
        self.push(Message::new(&execution, MessageKind::CompleteExecution))
            .await;
        Ok(())
    }

    pub(crate) async fn resume_execution(
        &self,
        mut execution: PipelineExecution,
        _message: &Message,
    ) -> Result<(), HandlerError> {
        if !execution.paused {
            return Ok(());
        }
        execution.paused = false;
        self.repository.update_status(&execution).await?;

        let paused: Vec<_> = execution
            .stages
            .iter()
            .filter(|s| s.status == ExecutionStatus::Paused)
            .map(|s| s.id)
            .collect();
        for stage_id in paused {
            self.push(Message::new(&execution, MessageKind::ResumeStage { stage_id }))
                .await;
        }
        Ok(())
    }

    /// Re-enqueue RunTask for every running task; recovery after a worker
    /// loss and the nudge behind prompt cancellation.
    pub(crate) async fn reschedule_execution(
        &self,
        execution: PipelineExecution,
        _message: &Message,
    ) -> Result<(), HandlerError> {
        for stage in &execution.stages {
            if stage.status != ExecutionStatus::Running {
                continue;
            }
            for task in &stage.tasks {
                if task.status == ExecutionStatus::Running {
                    self.push(Message::new(
                        &execution,
                        MessageKind::RunTask {
                            stage_id: stage.id,
                            task_id: task.id.clone(),
                        },
                    ))
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Promote the next waiting execution for a pipeline config, purging
    /// stale entries first when the config keeps only the newest.
    pub(crate) async fn start_waiting_executions(
        &self,
        _message: &Message,
        pipeline_config_id: &str,
        purge_queue: bool,
    ) -> Result<(), HandlerError> {
        let peers = self.repository.retrieve_for_config(pipeline_config_id).await?;

        if peers
            .iter()
            .any(|p| p.status == ExecutionStatus::Running)
        {
            debug!(pipeline_config_id, "an execution is already running; nothing to promote");
            return Ok(());
        }

        // ordered by build time by the repository contract
        let mut waiting: Vec<&PipelineExecution> = peers
            .iter()
            .filter(|p| {
                p.status == ExecutionStatus::NotStarted && !p.canceled && p.limit_concurrent
            })
            .collect();

        if purge_queue && waiting.len() > 1 {
            let purged: Vec<PipelineExecution> = waiting
                .drain(..waiting.len() - 1)
                .map(|p| (*p).clone())
                .collect();
            for mut victim in purged {
                info!(
                    execution_id = %victim.id,
                    pipeline_config_id,
                    "purging waiting execution superseded by a newer submission"
                );
                let now = Utc::now();
                victim.status = ExecutionStatus::Canceled;
                victim.canceled = true;
                victim.canceled_by = Some("admission".to_string());
                victim.cancellation_reason =
                    Some("superseded by a newer execution".to_string());
                victim.end_time = Some(now);
                // its stages never ran; they are recorded CANCELED with it
                for stage in &mut victim.stages {
                    if stage.status == ExecutionStatus::NotStarted {
                        stage.status = ExecutionStatus::Canceled;
                        stage.end_time = Some(now);
                    }
                }
                self.repository.store(&victim).await?;
            }
        }

        if let Some(next) = waiting.first() {
            info!(execution_id = %next.id, pipeline_config_id, "promoting waiting execution");
            self.push(Message::new(next, MessageKind::StartExecution)).await;
        }
        Ok(())
    }

    pub(crate) async fn invalid_execution(
        &self,
        execution: PipelineExecution,
        _message: &Message,
        reason: &str,
    ) -> Result<(), HandlerError> {
        self.force_complete(execution, reason).await
    }

    /// Force the execution TERMINAL with a synthetic reason; the backstop
    /// for livelocked or malformed flows.
    pub(crate) async fn force_complete(
        &self,
        mut execution: PipelineExecution,
        reason: &str,
    ) -> Result<(), HandlerError> {
        if execution.status.is_complete() {
            return Ok(());
        }
        warn!(execution_id = %execution.id, reason, "force-completing execution as TERMINAL");

        execution.status = ExecutionStatus::Terminal;
        execution.end_time = Some(Utc::now());
        execution.cancellation_reason = Some(reason.to_string());
        self.repository.update_status(&execution).await?;

        let running: Vec<_> = execution
            .top_level_stages()
            .filter(|s| s.status == ExecutionStatus::Running)
            .map(|s| s.id)
            .collect();
        for stage_id in running {
            self.push(Message::new(&execution, MessageKind::CancelStage { stage_id }))
                .await;
        }

        self.events
            .publish(Event::ExecutionComplete {
                execution: execution.clone(),
            })
            .await;

        if let Some(config_id) = execution.pipeline_config_id.clone() {
            self.admission.release(&config_id, execution.id);
            self.push(Message::new(
                &execution,
                MessageKind::StartWaitingExecutions {
                    pipeline_config_id: config_id,
                    purge_queue: !execution.keep_waiting_pipelines,
                },
            ))
            .await;
        }
        Ok(())
    }
}
