//! Builtin wait task

use crate::core::model::StageExecution;
use crate::tasks::{Task, TaskError, TaskResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;

/// Polls `Running` until the stage's `waitTime` (seconds) has elapsed
/// since the task started.
///
/// The canonical long-running task: it holds no state between
/// invocations and derives everything from the persisted stage.
pub struct WaitTask;

#[async_trait]
impl Task for WaitTask {
    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskError> {
        let wait_secs = stage
            .context
            .get("waitTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskError::MalformedContext("waitTime missing".to_string()))?;

        let task = stage
            .tasks
            .iter()
            .find(|t| t.implementing_type == "waitTask")
            .ok_or_else(|| TaskError::MalformedContext("no wait task on stage".to_string()))?;
        let started = task.start_time.unwrap_or_else(Utc::now);

        let elapsed = Utc::now().signed_duration_since(started).num_milliseconds();
        if elapsed >= wait_secs * 1000 {
            Ok(TaskResult::succeeded())
        } else {
            Ok(TaskResult::running())
        }
    }

    fn backoff_period(&self) -> Duration {
        Duration::from_millis(250)
    }
}
