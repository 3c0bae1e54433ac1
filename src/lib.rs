//! cascade - queue-driven execution engine for continuous-delivery pipelines

pub mod cli;
pub mod core;
pub mod events;
pub mod handlers;
pub mod persistence;
pub mod queue;
pub mod stages;
pub mod tasks;

// Re-export commonly used types
pub use core::{
    EngineConfig, ExecutionStatus, ExecutionType, PipelineDefinition, PipelineExecution,
    StageExecution, SyntheticStageOwner, TaskExecution,
};
pub use events::{CollectingPublisher, Event, EventPublisher, TracingPublisher};
pub use handlers::{Dispatcher, HandlerError};
pub use persistence::{ExecutionRepository, InMemoryRepository, RepositoryError};
pub use queue::{MemoryQueue, Message, MessageKind, QueueTransport};
pub use stages::{StageBlueprint, StageBuilder, StageCatalog, TaskNode};
pub use tasks::{Task, TaskError, TaskRegistry, TaskResult};
