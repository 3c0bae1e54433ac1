//! CLI output formatting

use crate::core::{ExecutionStatus, PipelineExecution};
use crate::events::Event;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::NotStarted => style("NOT_STARTED").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Paused => style("PAUSED").blue().to_string(),
        ExecutionStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        ExecutionStatus::FailedContinue => style("FAILED_CONTINUE").yellow().to_string(),
        ExecutionStatus::Skipped => style("SKIPPED").dim().to_string(),
        ExecutionStatus::Terminal => style("TERMINAL").red().to_string(),
        ExecutionStatus::Canceled => style("CANCELED").yellow().to_string(),
        ExecutionStatus::Stopped => style("STOPPED").yellow().to_string(),
        ExecutionStatus::Redirect => style("REDIRECT").dim().to_string(),
    }
}

/// Format a lifecycle event as a console line
pub fn format_event(event: &Event) -> String {
    match event {
        Event::ExecutionStarted { execution } => {
            format!("{} Execution started: {}", ROCKET, style(&execution.name).bold())
        }
        Event::ExecutionComplete { execution } => {
            let icon = if execution.status == ExecutionStatus::Succeeded {
                CHECK
            } else {
                CROSS
            };
            format!(
                "{} Execution complete: {} - {}",
                icon,
                style(&execution.name).bold(),
                format_status(execution.status)
            )
        }
        Event::StageStarted { stage } => {
            format!("{} Stage started: {}", SPINNER, style(&stage.name).cyan())
        }
        Event::StageComplete { stage } => {
            format!(
                "{} Stage complete: {} - {}",
                INFO,
                style(&stage.name).cyan(),
                format_status(stage.status)
            )
        }
        Event::TaskStarted { stage, task } => {
            format!("   task started: {}.{}", style(&stage.name).dim(), task.name)
        }
        Event::TaskComplete { stage, task } => {
            format!(
                "   task complete: {}.{} - {}",
                style(&stage.name).dim(),
                task.name,
                format_status(task.status)
            )
        }
    }
}

/// Summarize a finished execution, stage by stage
pub fn format_execution_summary(execution: &PipelineExecution) -> String {
    let mut lines = vec![format!(
        "{} - {}",
        style(&execution.name).bold(),
        format_status(execution.status)
    )];
    for stage in execution.stages.iter() {
        let marker = if stage.is_top_level() { "-" } else { "  ·" };
        lines.push(format!(
            " {} {} [{}] {}",
            marker,
            stage.name,
            stage.stage_type,
            format_status(stage.status)
        ));
    }
    lines.join("\n")
}
