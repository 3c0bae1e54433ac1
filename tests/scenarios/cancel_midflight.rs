//! Cancellation of an in-flight execution

use crate::helpers::*;
use cascade::events::Event;
use cascade::{ExecutionStatus, StageCatalog, TaskRegistry, TaskResult};
use std::sync::Arc;

#[tokio::test]
async fn cancel_converges_through_the_normal_drain() {
    let mut catalog = StageCatalog::new();
    let long_stage = Arc::new(TestStage::single_task("longTask").cancellable());
    catalog.register("long", long_stage.clone());
    let mut tasks = TaskRegistry::new();
    // never finishes on its own
    tasks.register("longTask", ScriptedTask::always(TaskResult::running()));

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "long-running"
stages:
  - refId: "1"
    type: "long"
    name: "forever"
"#,
        )
        .await;

    harness
        .await_execution(id, |e| e.status == ExecutionStatus::Running)
        .await;
    harness.cancel(id, "operator").await;

    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.status, ExecutionStatus::Canceled);
    assert!(execution.canceled);
    assert_eq!(execution.canceled_by.as_deref(), Some("operator"));
    assert_stage_status(&execution, "1", ExecutionStatus::Canceled);
    let forever = stage(&execution, "1");
    assert_eq!(forever.tasks[0].status, ExecutionStatus::Canceled);
    assert!(forever.end_time.is_some());

    // side-effect cancellation reached the builder
    assert!(long_stage.was_canceled());

    // the completion event carries the canceled snapshot
    let complete = harness
        .events
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::ExecutionComplete { execution } => Some(execution),
            _ => None,
        })
        .expect("no ExecutionComplete event");
    assert_eq!(complete.status, ExecutionStatus::Canceled);
}

#[tokio::test]
async fn cancel_before_start_never_runs_stages() {
    let mut catalog = StageCatalog::new();
    catalog.register("long", Arc::new(TestStage::single_task("longTask")));
    let mut tasks = TaskRegistry::new();
    let task = ScriptedTask::always(TaskResult::running());
    tasks.register("longTask", task.clone());

    let harness = TestHarness::new(catalog, tasks);

    // persist without starting, cancel, then start
    let definition = cascade::PipelineDefinition::from_yaml(
        r#"
application: "app"
name: "never-runs"
stages:
  - refId: "1"
    type: "long"
"#,
    )
    .unwrap();
    let mut execution = definition.to_execution();
    execution.canceled = true;
    let id = harness.submit_execution(execution).await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Canceled);

    // the stage never ran, but it does not outlive its execution: it is
    // recorded CANCELED alongside it
    assert_stage_status(&execution, "1", ExecutionStatus::Canceled);
    let never_ran = stage(&execution, "1");
    assert!(never_ran.start_time.is_none());
    assert!(never_ran.end_time.is_some());
    assert_eq!(task.call_count(), 0);
}
