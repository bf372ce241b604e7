//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline JSON file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Print the stages a pipeline would run in
#[derive(Debug, Args, Clone)]
pub struct StagesCommand {
    /// Path to pipeline JSON file
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline JSON file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Variable overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,

    /// Recorded as the user who triggered the run
    #[arg(long)]
    pub triggered_by: Option<String>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline id to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show one execution in full
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Query persisted log files
#[derive(Debug, Args, Clone)]
pub struct LogsCommand {
    /// Pipeline id to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Step (node) id to filter by
    #[arg(short, long)]
    pub step: Option<String>,

    /// Only entries at this level (debug, info, warning, error, critical)
    #[arg(long)]
    pub level: Option<String>,

    /// Maximum number of entries
    #[arg(short, long, default_value_t = 100)]
    pub limit: usize,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
