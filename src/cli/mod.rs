//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, RunCommand, ValidateCommand};

/// Queue-driven execution engine for continuous-delivery pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "cascade")]
#[command(version)]
#[command(about = "Drive pipeline executions to a terminal status", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline to completion on an in-process engine
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show execution history for a pipeline config
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }
}
