//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, LogsCommand, RunCommand, StagesCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Validate and run CI/CD pipeline graphs
#[derive(Debug, Parser, Clone)]
#[command(name = "pipeline")]
#[command(version)]
#[command(about = "Validate, stage and run CI/CD pipeline graphs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine configuration (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show the computed execution stages
    Stages(StagesCommand),

    /// Run a pipeline
    Run(RunCommand),

    /// Show execution history
    History(HistoryCommand),

    /// Query persisted pipeline logs
    Logs(LogsCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_vars() {
        let cli = Cli::try_parse_from([
            "pipeline",
            "--verbose",
            "run",
            "--file",
            "ci.json",
            "--var",
            "ENV=prod",
            "--var",
            "REGION=eu",
            "--no-history",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Run(run) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(run.variables.len(), 2);
        assert!(run.no_history);
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["pipeline", "stages", "-f", "ci.json", "--config", "engine.yaml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("engine.yaml")));
    }
}
