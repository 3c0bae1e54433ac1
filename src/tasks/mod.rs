//! Task contract: the atomic units the engine drives

pub mod wait;

pub use wait::WaitTask;

use crate::core::model::StageExecution;
use crate::core::status::ExecutionStatus;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error surfaced by a task implementation.
///
/// A task error fails the task TERMINAL; transient conditions should be
/// reported as a `Running` result with a backoff instead.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("malformed stage context: {0}")]
    MalformedContext(String),
}

/// What a task invocation produced
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: ExecutionStatus,
    /// Merged into the stage context
    pub context: Map<String, Value>,
    /// Merged into the stage outputs, visible downstream
    pub outputs: Map<String, Value>,
}

impl TaskResult {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            context: Map::new(),
            outputs: Map::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::status(ExecutionStatus::Succeeded)
    }

    pub fn running() -> Self {
        Self::status(ExecutionStatus::Running)
    }

    pub fn terminal() -> Self {
        Self::status(ExecutionStatus::Terminal)
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_output(mut self, key: &str, value: Value) -> Self {
        self.outputs.insert(key.to_string(), value);
        self
    }
}

/// An opaque unit of work invoked with the merged stage context.
///
/// Tasks waiting on external work return `Running`; the scheduler
/// re-invokes them after `backoff_period`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError>;

    /// Wall-clock budget relative to the task's start time.
    fn timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }

    /// Delay before the next invocation after a `Running` result.
    fn backoff_period(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// Maps `implementing_type` names to task implementations
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, implementing_type: &str, task: Arc<dyn Task>) {
        self.tasks.insert(implementing_type.to_string(), task);
    }

    pub fn get(&self, implementing_type: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(implementing_type).cloned()
    }

    /// Registry pre-loaded with the builtin task implementations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("waitTask", Arc::new(WaitTask));
        registry.register("succeedTask", Arc::new(SucceedTask));
        registry
    }
}

/// No-op task; completes immediately
pub struct SucceedTask;

#[async_trait]
impl Task for SucceedTask {
    async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskError> {
        Ok(TaskResult::succeeded())
    }
}
