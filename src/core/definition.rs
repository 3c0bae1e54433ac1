//! Submitted pipeline shape and conversion into an execution

use crate::core::model::{
    Authentication, ExecutionType, PipelineExecution, StageExecution,
};
use crate::core::status::ExecutionStatus;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

/// A pipeline as submitted by a client.
///
/// Unknown fields are preserved verbatim so definitions survive round-trips
/// through engine versions that model fewer keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub id: Option<Uuid>,
    pub application: String,
    pub name: String,
    #[serde(rename = "type", default = "default_execution_type")]
    pub execution_type: ExecutionType,
    pub pipeline_config_id: Option<String>,
    #[serde(default)]
    pub limit_concurrent: bool,
    #[serde(default)]
    pub keep_waiting_pipelines: bool,
    #[serde(default = "default_origin")]
    pub origin: String,
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_execution_type() -> ExecutionType {
    ExecutionType::Pipeline
}

fn default_origin() -> String {
    "api".to_string()
}

/// A stage as submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub ref_id: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub name: Option<String>,
    #[serde(default)]
    pub requisite_stage_ref_ids: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineDefinition {
    /// Parse a definition from YAML (JSON is a subset).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse pipeline definition")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse pipeline definition")
    }

    /// Load a definition from a file, dispatching on the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Validate the parts of the definition the engine itself depends on.
    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            for requisite in &stage.requisite_stage_ref_ids {
                if !self.stages.iter().any(|s| &s.ref_id == requisite) {
                    anyhow::bail!(
                        "stage '{}' depends on unknown refId '{}'",
                        stage.ref_id,
                        requisite
                    );
                }
            }
        }
        let execution = self.to_execution();
        if execution.has_cycle() {
            anyhow::bail!("pipeline contains a dependency cycle");
        }
        Ok(())
    }

    /// Materialize a fresh execution from this definition.
    ///
    /// Stage tasks and synthetic children are not created here; they are
    /// expanded on demand when each stage starts.
    pub fn to_execution(&self) -> PipelineExecution {
        let execution_id = self.id.unwrap_or_else(Uuid::new_v4);
        let stages = self
            .stages
            .iter()
            .map(|def| StageExecution {
                id: Uuid::new_v4(),
                execution_id,
                ref_id: def.ref_id.clone(),
                stage_type: def.stage_type.clone(),
                name: def.name.clone().unwrap_or_else(|| def.stage_type.clone()),
                context: def.context.clone(),
                outputs: Map::new(),
                requisite_stage_ref_ids: def.requisite_stage_ref_ids.clone(),
                parent_stage_id: None,
                synthetic_stage_owner: None,
                tasks: Vec::new(),
                status: ExecutionStatus::NotStarted,
                start_time: None,
                end_time: None,
                last_modified: None,
                extra: def.extra.clone(),
            })
            .collect();

        PipelineExecution {
            id: execution_id,
            execution_type: self.execution_type,
            application: self.application.clone(),
            name: self.name.clone(),
            pipeline_config_id: self.pipeline_config_id.clone(),
            stages,
            status: ExecutionStatus::NotStarted,
            build_time: Utc::now(),
            start_time: None,
            end_time: None,
            origin: self.origin.clone(),
            authentication: self.authentication.clone(),
            limit_concurrent: self.limit_concurrent,
            keep_waiting_pipelines: self.keep_waiting_pipelines,
            canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            paused: false,
            extra: self.extra.clone(),
        }
    }
}
