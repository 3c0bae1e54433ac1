//! CLI command definitions

use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline definition (YAML or JSON)
    #[arg(short, long)]
    pub file: String,

    /// Path to engine configuration YAML
    #[arg(long)]
    pub engine_config: Option<String>,

    /// Don't persist the execution to the local database
    #[arg(long)]
    pub no_history: bool,

    /// Seconds to wait for the execution to reach a terminal status
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: u64,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline definition (YAML or JSON)
    #[arg(short, long)]
    pub file: String,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline config id to list executions for
    #[arg(short, long)]
    pub pipeline_config_id: String,
}
