mod cli;
mod core;
mod events;
mod handlers;
mod persistence;
mod queue;
mod stages;
mod tasks;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use cli::output::*;
use cli::{Cli, Command};
use core::{EngineConfig, ExecutionStatus, PipelineDefinition};
use events::{Event, EventPublisher};
use handlers::Dispatcher;
use persistence::{ExecutionRepository, InMemoryRepository};
use queue::MemoryQueue;
use stages::StageCatalog;
use std::sync::Arc;
use std::time::Duration;
use tasks::TaskRegistry;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

/// Prints lifecycle events to the console as they happen
struct ConsolePublisher;

#[async_trait]
impl EventPublisher for ConsolePublisher {
    async fn publish(&self, event: Event) {
        println!("{}", format_event(&event));
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let definition =
        PipelineDefinition::from_file(&cmd.file).context("Failed to load pipeline definition")?;
    definition.validate()?;

    println!("{} Loaded pipeline: {}", INFO, style(&definition.name).bold());

    let config = match &cmd.engine_config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig {
            // local runs should converge fast, not on server cadence
            retry: core::RetryConfig {
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                ..Default::default()
            },
            ..Default::default()
        },
    };

    let repository: Arc<dyn ExecutionRepository> = build_repository(cmd.no_history).await?;
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        Arc::new(MemoryQueue::new()),
        Arc::clone(&repository),
        Arc::new(ConsolePublisher),
        Arc::new(StageCatalog::builtin()),
        Arc::new(TaskRegistry::builtin()),
    ));
    let workers = dispatcher.spawn_workers();

    let execution = definition.to_execution();
    let execution_type = execution.execution_type;
    let execution_id = dispatcher.submit(execution).await?;

    // wait for the engine to drive the execution to a terminal status
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cmd.timeout_secs);
    let finished = loop {
        if tokio::time::Instant::now() > deadline {
            break None;
        }
        let execution = repository.retrieve(execution_type, execution_id).await?;
        if execution.status.is_complete() {
            break Some(execution);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    dispatcher.shutdown();
    for worker in workers {
        worker.abort();
    }

    match finished {
        Some(execution) => {
            println!("\n{}", format_execution_summary(&execution));
            if execution.status != ExecutionStatus::Succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        None => {
            println!(
                "{} Timed out after {}s waiting for the execution to finish",
                CROSS, cmd.timeout_secs
            );
            std::process::exit(2);
        }
    }
}

#[cfg(feature = "sqlite")]
async fn build_repository(no_history: bool) -> Result<Arc<dyn ExecutionRepository>> {
    if no_history {
        Ok(Arc::new(InMemoryRepository::new()))
    } else {
        Ok(Arc::new(persistence::SqliteRepository::with_default_path().await?))
    }
}

#[cfg(not(feature = "sqlite"))]
async fn build_repository(_no_history: bool) -> Result<Arc<dyn ExecutionRepository>> {
    Ok(Arc::new(InMemoryRepository::new()))
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file).and_then(|d| d.validate().map(|_| d)) {
        Ok(definition) => {
            println!("{} Pipeline definition is valid", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Application: {}", style(&definition.application).bold());
            println!("  Stages: {}", style(definition.stages.len()).cyan());
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(&e).red());
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "sqlite")]
async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let repository = persistence::SqliteRepository::with_default_path().await?;
    let executions = repository
        .retrieve_for_config(&cmd.pipeline_config_id)
        .await?;

    if executions.is_empty() {
        println!("{} No executions for config '{}'", INFO, cmd.pipeline_config_id);
        return Ok(());
    }
    for execution in executions {
        println!(
            "{} {} - {} - started {}",
            style(&execution.id.to_string()[..8]).dim(),
            style(&execution.name).bold(),
            format_status(execution.status),
            execution
                .start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn show_history(_cmd: &HistoryCommand) -> Result<()> {
    anyhow::bail!("history requires the 'sqlite' feature")
}
