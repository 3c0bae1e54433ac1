//! Builtin stage types

use crate::core::model::StageExecution;
use crate::stages::{StageBuilder, TaskNode};
use async_trait::async_trait;

/// Waits for `waitTime` seconds (stage context), then succeeds.
pub struct WaitStage;

#[async_trait]
impl StageBuilder for WaitStage {
    fn task_graph(&self, _stage: &StageExecution) -> Vec<TaskNode> {
        vec![TaskNode::new("wait", "waitTask")]
    }
}

/// Completes immediately; useful as a join point in a DAG.
pub struct SucceedStage;

#[async_trait]
impl StageBuilder for SucceedStage {
    fn task_graph(&self, _stage: &StageExecution) -> Vec<TaskNode> {
        vec![TaskNode::new("succeed", "succeedTask")]
    }
}
