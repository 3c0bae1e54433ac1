//! Execution domain model: pipelines, stages, tasks, and graph traversal

use crate::core::status::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

/// Kind of execution being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// A run of a named pipeline definition
    Pipeline,
    /// An ad-hoc orchestration without a backing definition
    Orchestration,
}

/// Which side of its parent a synthetic stage runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyntheticStageOwner {
    /// Runs entirely before the parent's own tasks
    StageBefore,
    /// Runs after the parent's own tasks succeed
    StageAfter,
}

/// Identity of the submitter and the accounts the execution may touch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    pub user: Option<String>,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
}

/// Record of the last manual operation applied to a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastModified {
    pub user: String,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
    pub last_modified_time: DateTime<Utc>,
}

/// A single task within a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    /// Ordinal within the stage, starting at "1"
    pub id: String,
    pub name: String,
    /// Resolves to a task implementation in the registry
    pub implementing_type: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Head of a repeatable sub-sequence (REDIRECT target)
    #[serde(default)]
    pub loop_start: bool,
    /// Last task of a repeatable sub-sequence
    #[serde(default)]
    pub loop_end: bool,
    /// Completing this task completes the stage
    #[serde(default)]
    pub stage_end: bool,
}

/// A stage: one node in the execution DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub id: Uuid,
    /// Backref to the owning execution
    pub execution_id: Uuid,
    /// Stable id used by the pipeline author to wire dependencies
    pub ref_id: String,
    /// Resolves to a builder in the stage catalog
    #[serde(rename = "type")]
    pub stage_type: String,
    pub name: String,
    /// Opaque configuration and accumulated task context
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Values visible to downstream stages
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// DAG edges: refIds of stages that must complete first
    #[serde(default)]
    pub requisite_stage_ref_ids: Vec<String>,
    /// Set for synthetic children
    pub parent_stage_id: Option<Uuid>,
    pub synthetic_stage_owner: Option<SyntheticStageOwner>,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_modified: Option<LastModified>,
    /// Fields we don't model, preserved verbatim for round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageExecution {
    pub fn is_top_level(&self) -> bool {
        self.parent_stage_id.is_none()
    }

    pub fn task_by_id(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_by_id_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn first_task(&self) -> Option<&TaskExecution> {
        self.tasks.first()
    }

    /// The task after `task_id` in stage order, if any.
    pub fn next_task_after(&self, task_id: &str) -> Option<&TaskExecution> {
        let index = self.tasks.iter().position(|t| t.id == task_id)?;
        self.tasks.get(index + 1)
    }

    fn context_flag(&self, key: &str) -> bool {
        self.context.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// A failed task records FAILED_CONTINUE instead of failing the stage.
    pub fn continue_on_failure(&self) -> bool {
        self.context_flag("continueOnFailure")
    }

    /// On failure, let sibling branches finish before failing the execution.
    pub fn complete_other_branches_then_fail(&self) -> bool {
        self.context_flag("completeOtherBranchesThenFail")
    }

    /// Whether the pipeline author opted this stage into manual skipping.
    pub fn manual_skip_enabled(&self) -> bool {
        self.context_flag("manualSkip")
    }

    /// Extra wall-clock time granted to the running task, in milliseconds.
    /// Written only by a task's returned context.
    pub fn task_timeout_extension_ms(&self) -> i64 {
        self.context
            .get("taskTimeoutExtensionMs")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Record a synthetic failure reason, readable by operators.
    pub fn set_failure_reason(&mut self, reason: &str) {
        self.context
            .insert("reason".to_string(), Value::String(reason.to_string()));
    }

    pub fn merge_context(&mut self, delta: &Map<String, Value>) {
        for (key, value) in delta {
            self.context.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_outputs(&mut self, delta: &Map<String, Value>) {
        for (key, value) in delta {
            self.outputs.insert(key.clone(), value.clone());
        }
    }
}

/// One concrete run of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    pub id: Uuid,
    pub execution_type: ExecutionType,
    pub application: String,
    pub name: String,
    /// Groups re-runs of the same definition; admission key
    pub pipeline_config_id: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageExecution>,
    pub status: ExecutionStatus,
    /// When the execution record was created (submission time)
    pub build_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_origin")]
    pub origin: String,
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub limit_concurrent: bool,
    #[serde(default)]
    pub keep_waiting_pipelines: bool,
    #[serde(default)]
    pub canceled: bool,
    pub canceled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub paused: bool,
    /// Fields we don't model, preserved verbatim for round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_origin() -> String {
    "api".to_string()
}

impl PipelineExecution {
    pub fn stage_by_id(&self, stage_id: Uuid) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_by_id_mut(&mut self, stage_id: Uuid) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    pub fn stage_by_ref(&self, ref_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.ref_id == ref_id)
    }

    /// Stages that participate in the execution's final status derivation.
    pub fn top_level_stages(&self) -> impl Iterator<Item = &StageExecution> {
        self.stages.iter().filter(|s| s.is_top_level())
    }

    /// Top-level stages with no upstream dependencies; started first.
    pub fn initial_stages(&self) -> impl Iterator<Item = &StageExecution> {
        self.top_level_stages()
            .filter(|s| s.requisite_stage_ref_ids.is_empty())
    }

    /// Stages (any scope) that depend on `ref_id`, in definition order.
    pub fn downstream_of<'a>(&'a self, ref_id: &'a str) -> impl Iterator<Item = &'a StageExecution> {
        self.stages
            .iter()
            .filter(move |s| s.requisite_stage_ref_ids.iter().any(|r| r == ref_id))
    }

    /// Whether every upstream of `stage` has completed successfully.
    pub fn upstreams_complete(&self, stage: &StageExecution) -> bool {
        stage.requisite_stage_ref_ids.iter().all(|ref_id| {
            self.stage_by_ref(ref_id)
                .map(|s| s.status.is_successful())
                .unwrap_or(false)
        })
    }

    /// Synthetic children of `stage_id`, in definition order.
    pub fn synthetic_children(&self, stage_id: Uuid) -> impl Iterator<Item = &StageExecution> {
        self.stages
            .iter()
            .filter(move |s| s.parent_stage_id == Some(stage_id))
    }

    pub fn before_children(&self, stage_id: Uuid) -> impl Iterator<Item = &StageExecution> {
        self.synthetic_children(stage_id)
            .filter(|s| s.synthetic_stage_owner == Some(SyntheticStageOwner::StageBefore))
    }

    pub fn after_children(&self, stage_id: Uuid) -> impl Iterator<Item = &StageExecution> {
        self.synthetic_children(stage_id)
            .filter(|s| s.synthetic_stage_owner == Some(SyntheticStageOwner::StageAfter))
    }

    /// Replace a stage snapshot after a handler mutated its copy.
    pub fn update_stage(&mut self, stage: StageExecution) {
        if let Some(existing) = self.stage_by_id_mut(stage.id) {
            *existing = stage;
        } else {
            self.stages.push(stage);
        }
    }

    /// Detect a cycle in the refId dependency graph.
    ///
    /// A submitted cycle should be rejected upstream; this is the engine's
    /// own guard so a cycle that slips through marks the execution TERMINAL
    /// instead of hanging it.
    pub fn has_cycle(&self) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_progress: HashSet<&str> = HashSet::new();

        for stage in &self.stages {
            if self.visit(&stage.ref_id, &mut visited, &mut in_progress) {
                return true;
            }
        }
        false
    }

    fn visit<'a>(
        &'a self,
        ref_id: &'a str,
        visited: &mut HashSet<&'a str>,
        in_progress: &mut HashSet<&'a str>,
    ) -> bool {
        if visited.contains(ref_id) {
            return false;
        }
        if !in_progress.insert(ref_id) {
            return true;
        }
        if let Some(stage) = self.stage_by_ref(ref_id) {
            for upstream in &stage.requisite_stage_ref_ids {
                if self.visit(upstream, visited, in_progress) {
                    return true;
                }
            }
        }
        in_progress.remove(ref_id);
        visited.insert(ref_id);
        false
    }
}
