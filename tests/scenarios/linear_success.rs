//! Linear pipeline: two stages in sequence, everything succeeds

use crate::helpers::*;
use cascade::{ExecutionStatus, StageCatalog, TaskRegistry, TaskResult};
use std::sync::Arc;

#[tokio::test]
async fn linear_pipeline_succeeds_in_order() {
    let mut catalog = StageCatalog::new();
    catalog.register("deploy", Arc::new(TestStage::single_task("deployTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register("deployTask", ScriptedTask::always(TaskResult::succeeded()));

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "linear"
stages:
  - refId: "1"
    type: "deploy"
    name: "first"
  - refId: "2"
    type: "deploy"
    name: "second"
    requisiteStageRefIds: ["1"]
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "1", ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "2", ExecutionStatus::Succeeded);

    // dependency ordering is visible in the timestamps
    let first = stage(&execution, "1");
    let second = stage(&execution, "2");
    assert!(first.end_time.unwrap() <= second.start_time.unwrap());
    assert!(execution.end_time.is_some());

    assert_event_order(
        &harness.events.events(),
        &[
            "ExecutionStarted",
            "StageStarted(first)",
            "TaskComplete(first.run)",
            "StageComplete(first)",
            "StageStarted(second)",
            "TaskComplete(second.run)",
            "StageComplete(second)",
            "ExecutionComplete(SUCCEEDED)",
        ],
    );
}

#[tokio::test]
async fn multi_task_stage_runs_tasks_in_order() {
    let mut catalog = StageCatalog::new();
    catalog.register(
        "release",
        Arc::new(TestStage {
            tasks: vec![
                cascade::TaskNode::new("prepare", "prepareTask"),
                cascade::TaskNode::new("apply", "applyTask"),
                cascade::TaskNode::new("verify", "verifyTask"),
            ],
            ..Default::default()
        }),
    );
    let mut tasks = TaskRegistry::new();
    let prepare = ScriptedTask::always(TaskResult::succeeded());
    let apply = ScriptedTask::always(TaskResult::succeeded());
    let verify = ScriptedTask::always(TaskResult::succeeded());
    tasks.register("prepareTask", prepare.clone());
    tasks.register("applyTask", apply.clone());
    tasks.register("verifyTask", verify.clone());

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "release"
stages:
  - refId: "1"
    type: "release"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let release = stage(&execution, "1");
    assert_eq!(release.tasks.len(), 3);
    assert!(release
        .tasks
        .iter()
        .all(|t| t.status == ExecutionStatus::Succeeded));
    assert_eq!(prepare.call_count(), 1);
    assert_eq!(apply.call_count(), 1);
    assert_eq!(verify.call_count(), 1);
}

#[tokio::test]
async fn task_outputs_merge_into_stage_context() {
    let mut catalog = StageCatalog::new();
    catalog.register("bake", Arc::new(TestStage::single_task("bakeTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register(
        "bakeTask",
        ScriptedTask::always(
            TaskResult::succeeded()
                .with_context("imageId", serde_json::json!("ami-123"))
                .with_output("artifact", serde_json::json!("registry/app:1")),
        ),
    );

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "bake"
stages:
  - refId: "1"
    type: "bake"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    let bake = stage(&execution, "1");
    assert_eq!(bake.context["imageId"], serde_json::json!("ami-123"));
    assert_eq!(bake.outputs["artifact"], serde_json::json!("registry/app:1"));
}
