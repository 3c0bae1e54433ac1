//! Concurrency admission for a shared pipeline config

use crate::helpers::*;
use cascade::{ExecutionStatus, StageCatalog, TaskRegistry, TaskResult};
use std::sync::Arc;

const PIPELINE: &str = r#"
application: "app"
name: "serialized"
pipelineConfigId: "config-1"
limitConcurrent: true
stages:
  - refId: "1"
    type: "slow"
"#;

fn harness() -> TestHarness {
    let mut catalog = StageCatalog::new();
    catalog.register("slow", Arc::new(TestStage::single_task("slowTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register(
        "slowTask",
        ScriptedTask::new(vec![TaskResult::running(); 10], TaskResult::succeeded()),
    );
    TestHarness::new(catalog, tasks)
}

#[tokio::test]
async fn newer_submission_purges_older_waiting_execution() {
    let harness = harness();

    let first = harness.submit(PIPELINE).await;
    harness
        .await_execution(first, |e| e.status == ExecutionStatus::Running)
        .await;

    // both wait behind the running execution
    let second = harness.submit(PIPELINE).await;
    let third = harness.submit(PIPELINE).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        harness.execution(second).await.status,
        ExecutionStatus::NotStarted
    );
    assert_eq!(
        harness.execution(third).await.status,
        ExecutionStatus::NotStarted
    );

    // when the runner finishes, the queue is purged to its newest entry
    assert_eq!(
        harness.await_terminal(first).await.status,
        ExecutionStatus::Succeeded
    );
    let third_execution = harness.await_terminal(third).await;
    assert_eq!(third_execution.status, ExecutionStatus::Succeeded);

    let second_execution = harness.await_terminal(second).await;
    assert_eq!(second_execution.status, ExecutionStatus::Canceled);
    assert_eq!(
        second_execution.cancellation_reason.as_deref(),
        Some("superseded by a newer execution")
    );
    // the purged execution never ran; its stage is canceled with it
    assert!(second_execution.start_time.is_none());
    assert_stage_status(&second_execution, "1", ExecutionStatus::Canceled);
    assert!(stage(&second_execution, "1").start_time.is_none());
}

#[tokio::test]
async fn keep_waiting_promotes_in_submission_order() {
    let harness = harness();
    let pipeline = PIPELINE.replace(
        "limitConcurrent: true",
        "limitConcurrent: true\nkeepWaitingPipelines: true",
    );

    let first = harness.submit(&pipeline).await;
    harness
        .await_execution(first, |e| e.status == ExecutionStatus::Running)
        .await;
    let second = harness.submit(&pipeline).await;
    let third = harness.submit(&pipeline).await;

    // all three run eventually, oldest first, never two at once
    for id in [first, second, third] {
        let execution = harness.await_terminal(id).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }
    let second_execution = harness.execution(second).await;
    let third_execution = harness.execution(third).await;
    assert!(second_execution.start_time.unwrap() <= third_execution.start_time.unwrap());
    // serialized: each starts only after the previous ended
    assert!(harness.execution(first).await.end_time.unwrap() <= second_execution.start_time.unwrap());
    assert!(second_execution.end_time.unwrap() <= third_execution.start_time.unwrap());
}

#[tokio::test]
async fn unrelated_configs_run_concurrently() {
    let harness = harness();
    let other = PIPELINE.replace("config-1", "config-2");

    let first = harness.submit(PIPELINE).await;
    let second = harness.submit(&other).await;

    harness
        .await_execution(first, |e| e.status == ExecutionStatus::Running)
        .await;
    harness
        .await_execution(second, |e| e.status == ExecutionStatus::Running)
        .await;

    assert_eq!(
        harness.await_terminal(first).await.status,
        ExecutionStatus::Succeeded
    );
    assert_eq!(
        harness.await_terminal(second).await.status,
        ExecutionStatus::Succeeded
    );
}
