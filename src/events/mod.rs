//! Lifecycle event publication

use crate::core::model::{PipelineExecution, StageExecution, TaskExecution};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// A lifecycle event, carrying the snapshot that caused it
#[derive(Debug, Clone)]
pub enum Event {
    ExecutionStarted {
        execution: PipelineExecution,
    },
    ExecutionComplete {
        execution: PipelineExecution,
    },
    StageStarted {
        stage: StageExecution,
    },
    StageComplete {
        stage: StageExecution,
    },
    TaskStarted {
        stage: StageExecution,
        task: TaskExecution,
    },
    TaskComplete {
        stage: StageExecution,
        task: TaskExecution,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExecutionStarted { .. } => "ExecutionStarted",
            Event::ExecutionComplete { .. } => "ExecutionComplete",
            Event::StageStarted { .. } => "StageStarted",
            Event::StageComplete { .. } => "StageComplete",
            Event::TaskStarted { .. } => "TaskStarted",
            Event::TaskComplete { .. } => "TaskComplete",
        }
    }
}

/// Fire-and-forget sink for lifecycle events.
///
/// Publication failures are the publisher's problem; the scheduler never
/// fails a handler on account of an event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Publishes events as structured log lines
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: Event) {
        match &event {
            Event::ExecutionStarted { execution } | Event::ExecutionComplete { execution } => {
                info!(
                    event = event.name(),
                    execution_id = %execution.id,
                    application = %execution.application,
                    status = %execution.status,
                    "execution event"
                );
            }
            Event::StageStarted { stage } | Event::StageComplete { stage } => {
                info!(
                    event = event.name(),
                    execution_id = %stage.execution_id,
                    stage = %stage.name,
                    status = %stage.status,
                    "stage event"
                );
            }
            Event::TaskStarted { stage, task } | Event::TaskComplete { stage, task } => {
                info!(
                    event = event.name(),
                    execution_id = %stage.execution_id,
                    stage = %stage.name,
                    task = %task.name,
                    status = %task.status,
                    "task event"
                );
            }
        }
    }
}

/// Buffers events in memory; the test suite's window into the engine.
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<Event>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(Event::name).collect()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
