//! STOPPED branches and completeOtherBranchesThenFail

use crate::helpers::*;
use cascade::{ExecutionStatus, StageCatalog, TaskRegistry, TaskResult};
use std::sync::Arc;

fn catalog_and_tasks() -> (StageCatalog, TaskRegistry) {
    let mut catalog = StageCatalog::new();
    catalog.register("stopper", Arc::new(TestStage::single_task("stopTask")));
    catalog.register("steady", Arc::new(TestStage::single_task("steadyTask")));

    let mut tasks = TaskRegistry::new();
    tasks.register(
        "stopTask",
        ScriptedTask::always(TaskResult::status(ExecutionStatus::Stopped)),
    );
    tasks.register(
        "steadyTask",
        ScriptedTask::new(vec![TaskResult::running(); 5], TaskResult::succeeded()),
    );
    (catalog, tasks)
}

#[tokio::test]
async fn stopped_with_flag_fails_execution_after_siblings_finish() {
    let (catalog, tasks) = catalog_and_tasks();
    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "stop-and-fail"
stages:
  - refId: "1"
    type: "stopper"
    name: "stopping"
    context:
      completeOtherBranchesThenFail: true
  - refId: "2"
    type: "steady"
    name: "steady"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;

    // the sibling ran to completion, then the stop turned fatal
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    assert_stage_status(&execution, "1", ExecutionStatus::Stopped);
    assert_stage_status(&execution, "2", ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn stopped_without_flag_leaves_execution_succeeded() {
    let (catalog, tasks) = catalog_and_tasks();
    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "stop-quietly"
stages:
  - refId: "1"
    type: "stopper"
  - refId: "2"
    type: "steady"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "1", ExecutionStatus::Stopped);
    assert_stage_status(&execution, "2", ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn stopped_branch_does_not_start_its_downstream() {
    let (mut catalog, mut tasks) = catalog_and_tasks();
    catalog.register("tail", Arc::new(TestStage::single_task("tailTask")));
    let tail_task = ScriptedTask::always(TaskResult::succeeded());
    tasks.register("tailTask", tail_task.clone());

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "stop-gates"
stages:
  - refId: "1"
    type: "stopper"
  - refId: "2"
    type: "tail"
    requisiteStageRefIds: ["1"]
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "2", ExecutionStatus::NotStarted);
    assert_eq!(tail_task.call_count(), 0);
}
