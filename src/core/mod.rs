//! Core domain model
//!
//! This module defines the fundamental data structures that represent
//! executions, stages, tasks, and their submitted form.

pub mod config;
pub mod definition;
pub mod model;
pub mod status;

pub use config::{EngineConfig, RetryConfig};
pub use definition::{PipelineDefinition, StageDefinition};
pub use model::*;
pub use status::{fold_statuses, ExecutionStatus};
