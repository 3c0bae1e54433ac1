//! Failure folding: continueOnFailure, missing builders, timeouts

use crate::helpers::*;
use cascade::{ExecutionStatus, StageCatalog, TaskRegistry, TaskResult};
use std::sync::Arc;

#[tokio::test]
async fn continue_on_failure_folds_to_failed_continue() {
    let mut catalog = StageCatalog::new();
    catalog.register("flaky", Arc::new(TestStage::single_task("flakyTask")));
    catalog.register("after", Arc::new(TestStage::single_task("afterTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register("flakyTask", ScriptedTask::always(TaskResult::terminal()));
    let after_task = ScriptedTask::always(TaskResult::succeeded());
    tasks.register("afterTask", after_task.clone());

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "tolerant"
stages:
  - refId: "1"
    type: "flaky"
    context:
      continueOnFailure: true
  - refId: "2"
    type: "after"
    requisiteStageRefIds: ["1"]
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;

    // the failure is recorded but does not fail the execution, and the
    // original status stays introspectable
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_stage_status(&execution, "1", ExecutionStatus::FailedContinue);
    assert_stage_status(&execution, "2", ExecutionStatus::Succeeded);
    assert_eq!(after_task.call_count(), 1);

    let flaky = stage(&execution, "1");
    assert_eq!(flaky.tasks[0].status, ExecutionStatus::FailedContinue);
    assert_eq!(
        flaky.context["task.1.originalStatus"],
        serde_json::json!("TERMINAL")
    );
}

#[tokio::test]
async fn missing_builder_fails_the_stage_not_the_dispatcher() {
    let catalog = StageCatalog::new();
    let tasks = TaskRegistry::new();

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "unknown-type"
stages:
  - refId: "1"
    type: "doesNotExist"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    let failed = stage(&execution, "1");
    assert_eq!(failed.status, ExecutionStatus::Terminal);
    assert!(failed.context["reason"]
        .as_str()
        .unwrap()
        .contains("doesNotExist"));
}

#[tokio::test]
async fn task_errors_fail_the_stage_with_a_reason() {
    struct ExplodingTask;

    #[async_trait::async_trait]
    impl cascade::Task for ExplodingTask {
        async fn execute(
            &self,
            _stage: &cascade::StageExecution,
        ) -> Result<TaskResult, cascade::TaskError> {
            Err(cascade::TaskError::Failed("credentials expired".to_string()))
        }
    }

    let mut catalog = StageCatalog::new();
    catalog.register("exploding", Arc::new(TestStage::single_task("explodingTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register("explodingTask", Arc::new(ExplodingTask));

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "exploding"
stages:
  - refId: "1"
    type: "exploding"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    let failed = stage(&execution, "1");
    assert!(failed.context["reason"]
        .as_str()
        .unwrap()
        .contains("credentials expired"));
}

#[tokio::test]
async fn task_timeout_is_terminal_with_a_synthetic_reason() {
    struct SlowpokeTask;

    #[async_trait::async_trait]
    impl cascade::Task for SlowpokeTask {
        async fn execute(
            &self,
            _stage: &cascade::StageExecution,
        ) -> Result<TaskResult, cascade::TaskError> {
            Ok(TaskResult::running())
        }

        fn timeout(&self) -> std::time::Duration {
            std::time::Duration::from_millis(50)
        }

        fn backoff_period(&self) -> std::time::Duration {
            std::time::Duration::from_millis(20)
        }
    }

    let mut catalog = StageCatalog::new();
    catalog.register("slowpoke", Arc::new(TestStage::single_task("slowpokeTask")));
    let mut tasks = TaskRegistry::new();
    tasks.register("slowpokeTask", Arc::new(SlowpokeTask));

    let harness = TestHarness::new(catalog, tasks);
    let id = harness
        .submit(
            r#"
application: "app"
name: "timeout"
stages:
  - refId: "1"
    type: "slowpoke"
"#,
        )
        .await;

    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.status, ExecutionStatus::Terminal);
    let failed = stage(&execution, "1");
    assert_eq!(failed.tasks[0].status, ExecutionStatus::Terminal);
    assert!(failed.context["reason"].as_str().unwrap().contains("timed out"));
}
