//! On-demand stage graph expansion

use crate::core::model::{
    PipelineExecution, StageExecution, SyntheticStageOwner, TaskExecution,
};
use crate::core::status::ExecutionStatus;
use crate::stages::{StageBlueprint, StageBuilder};
use serde_json::Map;
use uuid::Uuid;

/// Materialize the builder's contribution for a stage being started:
/// its ordered tasks and its before/after synthetic children.
///
/// Idempotent: a stage that already has tasks or children is left alone,
/// so redelivered StartStage messages observe the persisted shape.
pub fn expand_stage(
    execution: &mut PipelineExecution,
    stage_id: Uuid,
    builder: &dyn StageBuilder,
) {
    let already_expanded = {
        let stage = match execution.stage_by_id(stage_id) {
            Some(s) => s,
            None => return,
        };
        !stage.tasks.is_empty() || execution.synthetic_children(stage_id).next().is_some()
    };
    if already_expanded {
        return;
    }

    let stage_snapshot = execution.stage_by_id(stage_id).unwrap().clone();

    let nodes = builder.task_graph(&stage_snapshot);
    let task_count = nodes.len();
    let tasks: Vec<TaskExecution> = nodes
        .into_iter()
        .enumerate()
        .map(|(index, node)| TaskExecution {
            id: (index + 1).to_string(),
            name: node.name,
            implementing_type: node.implementing_type,
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            loop_start: node.loop_start,
            loop_end: node.loop_end,
            stage_end: index + 1 == task_count,
        })
        .collect();

    let before = materialize(
        &stage_snapshot,
        builder.before_stages(&stage_snapshot),
        SyntheticStageOwner::StageBefore,
    );
    let after = materialize(
        &stage_snapshot,
        builder.after_stages(&stage_snapshot),
        SyntheticStageOwner::StageAfter,
    );

    if let Some(stage) = execution.stage_by_id_mut(stage_id) {
        stage.tasks = tasks;
    }

    // children sit next to their parent so definition order stays readable
    let parent_index = execution
        .stages
        .iter()
        .position(|s| s.id == stage_id)
        .unwrap();
    for (offset, child) in after.into_iter().enumerate() {
        execution.stages.insert(parent_index + 1 + offset, child);
    }
    for (offset, child) in before.into_iter().enumerate() {
        execution.stages.insert(parent_index + offset, child);
    }
}

fn materialize(
    parent: &StageExecution,
    blueprints: Vec<StageBlueprint>,
    owner: SyntheticStageOwner,
) -> Vec<StageExecution> {
    let separator = match owner {
        SyntheticStageOwner::StageBefore => '<',
        SyntheticStageOwner::StageAfter => '>',
    };
    let ref_ids: Vec<String> = (1..=blueprints.len())
        .map(|n| format!("{}{}{}", parent.ref_id, separator, n))
        .collect();

    blueprints
        .into_iter()
        .enumerate()
        .map(|(index, blueprint)| StageExecution {
            id: Uuid::new_v4(),
            execution_id: parent.execution_id,
            ref_id: ref_ids[index].clone(),
            stage_type: blueprint.stage_type,
            name: blueprint.name,
            context: blueprint.context,
            outputs: Map::new(),
            requisite_stage_ref_ids: blueprint
                .requires
                .iter()
                .filter_map(|&i| ref_ids.get(i).cloned())
                .collect(),
            parent_stage_id: Some(parent.id),
            synthetic_stage_owner: Some(owner),
            tasks: Vec::new(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            last_modified: None,
            extra: Map::new(),
        })
        .collect()
}

/// Roots of a synthetic group: children with no requisites inside it.
pub fn group_roots<'a>(
    children: impl Iterator<Item = &'a StageExecution>,
) -> Vec<&'a StageExecution> {
    children
        .filter(|c| c.requisite_stage_ref_ids.is_empty())
        .collect()
}
