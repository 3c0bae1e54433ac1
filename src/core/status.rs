//! Execution status lattice shared by executions, stages, and tasks

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an execution, stage, or task.
///
/// Statuses advance monotonically toward a terminal value; the only
/// reversible edge is `Running` ⇄ `Paused`. `Redirect` is a transient
/// task-only signal and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Has not yet started
    NotStarted,
    /// Currently running
    Running,
    /// Suspended; resumable back to Running
    Paused,
    /// Completed successfully
    Succeeded,
    /// Failed, but the failure does not fail the enclosing execution
    FailedContinue,
    /// Deliberately not run; treated as success for scheduling
    Skipped,
    /// Failed fatally
    Terminal,
    /// Canceled before reaching a natural end
    Canceled,
    /// Halted its branch without failing the execution
    Stopped,
    /// Transient task signal requesting a loop reset
    Redirect,
}

impl ExecutionStatus {
    /// Whether this is a terminal status (no further transitions).
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::FailedContinue
                | ExecutionStatus::Skipped
                | ExecutionStatus::Stopped
                | ExecutionStatus::Terminal
                | ExecutionStatus::Canceled
        )
    }

    /// Whether downstream stages may run after an upstream with this status.
    pub fn is_successful(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::FailedContinue | ExecutionStatus::Skipped
        )
    }

    /// Whether this status halts the enclosing branch.
    pub fn is_halt(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Terminal | ExecutionStatus::Canceled | ExecutionStatus::Stopped
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::NotStarted => "NOT_STARTED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::FailedContinue => "FAILED_CONTINUE",
            ExecutionStatus::Skipped => "SKIPPED",
            ExecutionStatus::Terminal => "TERMINAL",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Stopped => "STOPPED",
            ExecutionStatus::Redirect => "REDIRECT",
        };
        f.write_str(s)
    }
}

/// Fold a set of task statuses into the status of their enclosing stage.
///
/// Returns `Running` while any member is still incomplete. `Skipped`
/// members fold to `Succeeded`; a lone `FailedContinue` keeps the stage
/// non-fatally failed. An empty set folds to `Succeeded`.
pub fn fold_statuses<I>(statuses: I) -> ExecutionStatus
where
    I: IntoIterator<Item = ExecutionStatus>,
{
    let mut result = ExecutionStatus::Succeeded;
    for status in statuses {
        match status {
            ExecutionStatus::Terminal => return ExecutionStatus::Terminal,
            ExecutionStatus::Canceled => result = worst(result, ExecutionStatus::Canceled),
            ExecutionStatus::Stopped => result = worst(result, ExecutionStatus::Stopped),
            ExecutionStatus::FailedContinue => {
                result = worst(result, ExecutionStatus::FailedContinue)
            }
            ExecutionStatus::Succeeded | ExecutionStatus::Skipped => {}
            // anything else means the set is not done yet
            _ => result = worst(result, ExecutionStatus::Running),
        }
    }
    result
}

fn rank(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::Succeeded => 0,
        ExecutionStatus::FailedContinue => 1,
        ExecutionStatus::Running => 2,
        ExecutionStatus::Stopped => 3,
        ExecutionStatus::Canceled => 4,
        ExecutionStatus::Terminal => 5,
        _ => 2,
    }
}

fn worst(a: ExecutionStatus, b: ExecutionStatus) -> ExecutionStatus {
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}
