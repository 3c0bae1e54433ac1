//! Stage builder contract and catalog

pub mod builtin;

pub use builtin::{SucceedStage, WaitStage};

use crate::core::model::StageExecution;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A task contributed by a builder, in stage order
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: String,
    pub implementing_type: String,
    /// Head of a repeatable sub-sequence (REDIRECT target)
    pub loop_start: bool,
    /// Last task of a repeatable sub-sequence
    pub loop_end: bool,
}

impl TaskNode {
    pub fn new(name: &str, implementing_type: &str) -> Self {
        Self {
            name: name.to_string(),
            implementing_type: implementing_type.to_string(),
            loop_start: false,
            loop_end: false,
        }
    }

    pub fn loop_start(mut self) -> Self {
        self.loop_start = true;
        self
    }

    pub fn loop_end(mut self) -> Self {
        self.loop_end = true;
        self
    }
}

/// A synthetic child stage contributed by a builder.
///
/// `requires` holds indices of earlier blueprints in the same group; the
/// expander wires them into refId requisites. An empty `requires` makes
/// the blueprint a root of its group.
#[derive(Debug, Clone)]
pub struct StageBlueprint {
    pub name: String,
    pub stage_type: String,
    pub context: Map<String, Value>,
    pub requires: Vec<usize>,
}

impl StageBlueprint {
    pub fn new(name: &str, stage_type: &str) -> Self {
        Self {
            name: name.to_string(),
            stage_type: stage_type.to_string(),
            context: Map::new(),
            requires: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn after(mut self, index: usize) -> Self {
        self.requires.push(index);
        self
    }
}

/// Contributes tasks and synthetic children when a stage of its type
/// starts. Expansion happens on demand, never at submission time.
#[async_trait]
pub trait StageBuilder: Send + Sync {
    /// The ordered tasks this stage runs.
    fn task_graph(&self, stage: &StageExecution) -> Vec<TaskNode>;

    /// Synthetic children that run entirely before this stage's tasks.
    fn before_stages(&self, _stage: &StageExecution) -> Vec<StageBlueprint> {
        Vec::new()
    }

    /// Synthetic children that run after this stage's tasks succeed.
    fn after_stages(&self, _stage: &StageExecution) -> Vec<StageBlueprint> {
        Vec::new()
    }

    /// Whether this stage type has a cloud-side operation to abort.
    fn cancellable(&self) -> bool {
        false
    }

    /// Side-effect cancellation hook. Only invoked for cancellable
    /// builders and stages that have actually run.
    async fn cancel(&self, _stage: &StageExecution) {}

    /// Whether an operator may skip this stage while it runs.
    fn can_manually_skip(&self, _stage: &StageExecution) -> bool {
        false
    }

    /// Scrub state before the stage is re-run.
    fn prepare_for_restart(&self, _stage: &mut StageExecution) {}
}

/// Maps stage type names to builders
#[derive(Default)]
pub struct StageCatalog {
    builders: HashMap<String, Arc<dyn StageBuilder>>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage_type: &str, builder: Arc<dyn StageBuilder>) {
        self.builders.insert(stage_type.to_string(), builder);
    }

    pub fn get(&self, stage_type: &str) -> Option<Arc<dyn StageBuilder>> {
        self.builders.get(stage_type).cloned()
    }

    /// Catalog pre-loaded with the builtin stage types.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("wait", Arc::new(WaitStage));
        catalog.register("succeed", Arc::new(SucceedStage));
        catalog
    }
}
