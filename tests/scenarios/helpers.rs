//! Test utility functions for the scenario suite

use cascade::core::{EngineConfig, RetryConfig};
use cascade::events::Event;
use cascade::{
    CollectingPublisher, Dispatcher, ExecutionRepository, ExecutionStatus, ExecutionType,
    InMemoryRepository, MemoryQueue, Message, MessageKind, PipelineDefinition, PipelineExecution,
    StageBlueprint, StageBuilder, StageCatalog, StageExecution, Task, TaskError, TaskNode,
    TaskRegistry, TaskResult,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Task that returns a scripted sequence of results, then a default.
pub struct ScriptedTask {
    script: Mutex<VecDeque<TaskResult>>,
    default: TaskResult,
    backoff: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedTask {
    pub fn new(script: Vec<TaskResult>, default: TaskResult) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default,
            backoff: Duration::from_millis(20),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(result: TaskResult) -> Arc<Self> {
        Self::new(Vec::new(), result)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for ScriptedTask {
    async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.default.clone()))
    }

    fn backoff_period(&self) -> Duration {
        self.backoff
    }
}

/// Configurable stage builder for tests
#[derive(Default)]
pub struct TestStage {
    pub tasks: Vec<TaskNode>,
    pub before: Vec<StageBlueprint>,
    pub after: Vec<StageBlueprint>,
    pub cancellable: bool,
    pub cancel_invoked: Arc<AtomicBool>,
}

impl TestStage {
    pub fn single_task(implementing_type: &str) -> Self {
        Self {
            tasks: vec![TaskNode::new("run", implementing_type)],
            ..Default::default()
        }
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn was_canceled(&self) -> bool {
        self.cancel_invoked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageBuilder for TestStage {
    fn task_graph(&self, _stage: &StageExecution) -> Vec<TaskNode> {
        self.tasks.clone()
    }

    fn before_stages(&self, _stage: &StageExecution) -> Vec<StageBlueprint> {
        self.before.clone()
    }

    fn after_stages(&self, _stage: &StageExecution) -> Vec<StageBlueprint> {
        self.after.clone()
    }

    fn cancellable(&self) -> bool {
        self.cancellable
    }

    async fn cancel(&self, _stage: &StageExecution) {
        self.cancel_invoked.store(true, Ordering::SeqCst);
    }
}

/// A full in-process engine wired with test doubles
pub struct TestHarness {
    pub dispatcher: Arc<Dispatcher>,
    pub repository: Arc<InMemoryRepository>,
    pub events: Arc<CollectingPublisher>,
    workers: Vec<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new(catalog: StageCatalog, tasks: TaskRegistry) -> Self {
        let config = EngineConfig {
            worker_count: 4,
            poll_interval_ms: 2,
            handler_timeout_secs: 5,
            retry: RetryConfig {
                base_delay_ms: 20,
                max_delay_ms: 200,
                attempts_ceiling: 1000,
            },
        };
        let repository = Arc::new(InMemoryRepository::new());
        let events = Arc::new(CollectingPublisher::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            Arc::new(MemoryQueue::new()),
            Arc::clone(&repository) as Arc<dyn ExecutionRepository>,
            Arc::clone(&events) as Arc<dyn cascade::EventPublisher>,
            Arc::new(catalog),
            Arc::new(tasks),
        ));
        let workers = dispatcher.spawn_workers();
        Self {
            dispatcher,
            repository,
            events,
            workers,
        }
    }

    /// Parse, persist, and start a pipeline definition.
    pub async fn submit(&self, yaml: &str) -> Uuid {
        let definition = PipelineDefinition::from_yaml(yaml).expect("invalid test pipeline");
        self.submit_execution(definition.to_execution()).await
    }

    pub async fn submit_execution(&self, execution: PipelineExecution) -> Uuid {
        self.dispatcher
            .submit(execution)
            .await
            .expect("failed to submit execution")
    }

    pub async fn execution(&self, id: Uuid) -> PipelineExecution {
        self.repository
            .retrieve(ExecutionType::Pipeline, id)
            .await
            .expect("execution not found")
    }

    /// Enqueue a cancellation for a running execution.
    pub async fn cancel(&self, id: Uuid, user: &str) {
        let execution = self.execution(id).await;
        self.dispatcher
            .queue()
            .push(Message::new(
                &execution,
                MessageKind::CancelExecution {
                    user: Some(user.to_string()),
                    reason: Some("canceled by test".to_string()),
                },
            ))
            .await;
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn await_terminal(&self, id: Uuid) -> PipelineExecution {
        self.await_execution(id, |e| e.status.is_complete()).await
    }

    /// Wait until `predicate` holds for the execution, panicking after 10s.
    pub async fn await_execution(
        &self,
        id: Uuid,
        predicate: impl Fn(&PipelineExecution) -> bool,
    ) -> PipelineExecution {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let execution = self.execution(id).await;
            if predicate(&execution) {
                return execution;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for execution {}; status {} stages {:?}",
                    id,
                    execution.status,
                    execution
                        .stages
                        .iter()
                        .map(|s| (s.ref_id.clone(), s.status))
                        .collect::<Vec<_>>()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Find a stage by refId
pub fn stage<'a>(execution: &'a PipelineExecution, ref_id: &str) -> &'a StageExecution {
    execution
        .stage_by_ref(ref_id)
        .unwrap_or_else(|| panic!("stage '{}' not found", ref_id))
}

/// Assert a stage reached the expected status
pub fn assert_stage_status(execution: &PipelineExecution, ref_id: &str, expected: ExecutionStatus) {
    let actual = stage(execution, ref_id).status;
    assert_eq!(
        actual, expected,
        "stage '{}' should be {:?}, was {:?}",
        ref_id, expected, actual
    );
}

/// Event names with their subject (stage/task name), for order assertions
pub fn event_trace(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            Event::ExecutionStarted { .. } => "ExecutionStarted".to_string(),
            Event::ExecutionComplete { execution } => {
                format!("ExecutionComplete({})", execution.status)
            }
            Event::StageStarted { stage } => format!("StageStarted({})", stage.name),
            Event::StageComplete { stage } => format!("StageComplete({})", stage.name),
            Event::TaskStarted { stage, task } => {
                format!("TaskStarted({}.{})", stage.name, task.name)
            }
            Event::TaskComplete { stage, task } => {
                format!("TaskComplete({}.{})", stage.name, task.name)
            }
        })
        .collect()
}

/// Assert `expected` appears as a subsequence of the published events.
pub fn assert_event_order(events: &[Event], expected: &[&str]) {
    let trace = event_trace(events);
    let mut position = 0;
    for entry in &trace {
        if position < expected.len() && entry == expected[position] {
            position += 1;
        }
    }
    assert_eq!(
        position,
        expected.len(),
        "expected event order {:?} within {:?}",
        expected,
        trace
    );
}
