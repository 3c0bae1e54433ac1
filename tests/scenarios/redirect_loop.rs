//! Rolling push: REDIRECT resets the loop range until done

use crate::helpers::*;
use cascade::events::Event;
use cascade::{ExecutionStatus, StageCatalog, TaskNode, TaskRegistry, TaskResult};
use std::sync::Arc;

#[tokio::test]
async fn redirect_replays_the_loop_range() {
    let mut catalog = StageCatalog::new();
    catalog.register(
        "rollingPush",
        Arc::new(TestStage {
            tasks: vec![
                TaskNode::new("bootstrap", "bootstrapTask"),
                TaskNode::new("determineTarget", "determineTargetTask").loop_start(),
                TaskNode::new("disable", "disableTask"),
                TaskNode::new("deploy", "deployTask"),
                TaskNode::new("enable", "enableTask").loop_end(),
            ],
            ..Default::default()
        }),
    );

    let mut tasks = TaskRegistry::new();
    let bootstrap = ScriptedTask::always(TaskResult::succeeded());
    let determine = ScriptedTask::always(TaskResult::succeeded());
    let disable = ScriptedTask::always(TaskResult::succeeded());
    let deploy = ScriptedTask::always(TaskResult::succeeded());
    // two more target groups to roll through, then done
    let enable = ScriptedTask::new(
        vec![
            TaskResult::status(ExecutionStatus::Redirect),
            TaskResult::status(ExecutionStatus::Redirect),
        ],
        TaskResult::succeeded(),
    );
    tasks.register("bootstrapTask", bootstrap.clone());
    tasks.register("determineTargetTask", determine.clone());
    tasks.register("disableTask", disable.clone());
    tasks.register("deployTask", deploy.clone());
    tasks.register("enableTask", enable.clone());

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "rolling"
stages:
  - refId: "1"
    type: "rollingPush"
    name: "push"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "1", ExecutionStatus::Succeeded);
    let push = stage(&execution, "1");
    assert!(push
        .tasks
        .iter()
        .all(|t| t.status == ExecutionStatus::Succeeded));

    // the task before the loop head runs once; the loop range runs once
    // per REDIRECT plus the final pass
    assert_eq!(bootstrap.call_count(), 1);
    assert_eq!(determine.call_count(), 3);
    assert_eq!(disable.call_count(), 3);
    assert_eq!(deploy.call_count(), 3);
    assert_eq!(enable.call_count(), 3);

    // REDIRECT itself is never observable: no event carries it, and the
    // redirecting task publishes TaskComplete only for its final pass
    let events = harness.events.events();
    for event in &events {
        if let Event::TaskComplete { task, .. } = event {
            assert_ne!(task.status, ExecutionStatus::Redirect);
        }
    }
    let enable_completions = events
        .iter()
        .filter(|e| matches!(e, Event::TaskComplete { task, .. } if task.name == "enable"))
        .count();
    assert_eq!(enable_completions, 1);
}

#[tokio::test]
async fn redirect_without_loop_start_fails_the_stage() {
    let mut catalog = StageCatalog::new();
    catalog.register(
        "broken",
        Arc::new(TestStage {
            tasks: vec![TaskNode::new("spin", "spinTask")],
            ..Default::default()
        }),
    );
    let mut tasks = TaskRegistry::new();
    tasks.register(
        "spinTask",
        ScriptedTask::always(TaskResult::status(ExecutionStatus::Redirect)),
    );

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "broken-loop"
stages:
  - refId: "1"
    type: "broken"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    assert_stage_status(&execution, "1", ExecutionStatus::Terminal);
}
