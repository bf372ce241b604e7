use anyhow::{Context, Result};
use pipeline_engine::cli::commands::{
    HistoryCommand, LogsCommand, RunCommand, StagesCommand, ValidateCommand,
};
use pipeline_engine::cli::output::*;
use pipeline_engine::cli::{Cli, Command};
use pipeline_engine::core::{ExecutionStatus, Pipeline, TriggerInfo};
use pipeline_engine::execution::{ExecutionEvent, FnObserver, Orchestrator};
use pipeline_engine::logging::{
    HistoryQuery, LogCallback, LogEntry, LogFilter, LogLevel, LogSink, LogStreamer,
};
use pipeline_engine::persistence::PersistenceBackend;
use pipeline_engine::validation::Validator;
use pipeline_engine::EngineConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load(cli.config.as_deref())?;
    debug!("Engine config: {:?}", config);

    let ok = match &cli.command {
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Stages(cmd) => show_stages(cmd)?,
        Command::Run(cmd) => run_pipeline(cmd, &config).await?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Logs(cmd) => show_logs(cmd, &config).await?,
    };
    if !ok {
        std::process::exit(1);
    }

    Ok(())
}

fn load_pipeline(path: &std::path::Path) -> Result<Pipeline> {
    Pipeline::from_file(path).with_context(|| format!("Failed to load pipeline {}", path.display()))
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    let store = pipeline_engine::persistence::SqliteExecutionStore::with_default_path().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    anyhow::bail!("execution history needs the `sqlite` feature")
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<bool> {
    let pipeline = load_pipeline(&cmd.file)?;
    let report = Validator::new().validate_pipeline(&pipeline);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.is_valid);
    }

    println!("{} Validating {}", INFO, style(pipeline.name()).bold());
    println!("{}", format_validation_report(&report));
    if report.is_valid {
        println!("{} Pipeline is valid", CHECK);
    } else {
        println!("{} Pipeline is {}", CROSS, style("invalid").red());
    }
    Ok(report.is_valid)
}

fn show_stages(cmd: &StagesCommand) -> Result<bool> {
    let pipeline = load_pipeline(&cmd.file)?;
    match pipeline.compute_stages() {
        Ok(stages) => {
            println!(
                "{} {} runs in {} stages",
                INFO,
                style(pipeline.name()).bold(),
                stages.len()
            );
            for (index, stage) in stages.iter().enumerate() {
                let names: Vec<String> = stage
                    .iter()
                    .map(|id| match pipeline.node(id) {
                        Some(node) if node.name != *id => format!("{} ({})", node.name, id),
                        _ => id.clone(),
                    })
                    .collect();
                println!("  {} {}", style(format!("{}.", index + 1)).dim(), names.join(", "));
            }
            Ok(true)
        }
        Err(e) => {
            println!("{} {}", CROSS, style(e).red());
            Ok(false)
        }
    }
}

async fn run_pipeline(cmd: &RunCommand, config: &EngineConfig) -> Result<bool> {
    let pipeline = load_pipeline(&cmd.file)?;
    println!("{} Loaded pipeline: {}", INFO, style(pipeline.name()).bold());

    let report = Validator::new().validate_pipeline(&pipeline);
    if !report.is_valid {
        println!("{}", format_validation_report(&report));
        println!("{} Refusing to run an invalid pipeline", CROSS);
        return Ok(false);
    }
    if report.summary.warnings > 0 {
        println!(
            "{} {} validation warnings (run `validate` for details)",
            WARN, report.summary.warnings
        );
    }

    let environment: HashMap<String, String> = cmd.variables.iter().cloned().collect();
    for (key, value) in &environment {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let streamer = LogStreamer::new(config.logging.clone());
    streamer.start().await?;

    let stages = pipeline.compute_stages()?;
    let progress = create_progress_bar(stages.len());

    let console = progress.clone();
    let filter = LogFilter::new()
        .pipeline_ids([pipeline.id()])
        .levels([
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ]);
    let print_line: LogCallback = Arc::new(move |entry: &LogEntry| -> anyhow::Result<()> {
        console.println(format_log_entry(entry));
        Ok(())
    });
    streamer.subscribe("console", Some(filter), print_line);

    let sink: Arc<dyn LogSink> = Arc::new(streamer.clone());
    let mut orchestrator = Orchestrator::from_config(config, sink);
    if !cmd.no_history {
        orchestrator = orchestrator.with_store(history_store().await?);
    }

    let events = progress.clone();
    orchestrator.subscribe(
        "console",
        Arc::new(FnObserver::new(move |event: &ExecutionEvent| {
            if let ExecutionEvent::StageStarted { stage, nodes, .. } = event {
                events.set_position(*stage as u64);
                events.set_message(nodes.join(", "));
            }
            if matches!(event, ExecutionEvent::ExecutionCompleted { .. }) {
                events.set_position(events.length().unwrap_or(0));
            }
            events.println(format_execution_event(event));
        })),
    );
    orchestrator.start();

    let trigger = match &cmd.triggered_by {
        Some(user) => TriggerInfo::manual(user),
        None => TriggerInfo::manual(whoami()),
    };
    let execution_id = orchestrator.submit(pipeline, trigger, environment).await?;

    let execution = tokio::select! {
        execution = orchestrator.wait(execution_id) => execution,
        _ = tokio::signal::ctrl_c() => {
            progress.println(format!("{} Interrupted, cancelling", WARN));
            orchestrator.cancel(execution_id, "user interrupt").await;
            orchestrator.wait(execution_id).await
        }
    };

    orchestrator.shutdown().await;
    progress.finish_and_clear();
    streamer.shutdown().await;

    let Some(execution) = execution else {
        error!("Execution {} disappeared before finishing", execution_id);
        return Ok(false);
    };

    println!("{}", separator());
    let mut nodes: Vec<_> = execution.node_executions.values().collect();
    nodes.sort_by_key(|n| (n.started_at.is_none(), n.started_at));
    for node in nodes {
        let duration = node
            .duration
            .map(|d| std::time::Duration::from_secs_f64(d.max(0.0)))
            .map(|d| format!(" {}", style(format_duration(d)).dim()))
            .unwrap_or_default();
        let retries = if node.retry_count > 0 {
            format!(" {}", style(format!("({} retries)", node.retry_count)).dim())
        } else {
            String::new()
        };
        println!(
            "  {} {}{}{}",
            format_node_status(node.status),
            style(&node.node_name).bold(),
            duration,
            retries
        );
    }
    if !cmd.no_history {
        println!(
            "{} Execution saved to history (ID: {})",
            INFO,
            style(execution.execution_id).dim()
        );
    }

    let succeeded = execution.status == ExecutionStatus::Completed;
    if succeeded {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&execution.pipeline_name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&execution.pipeline_name).bold(),
            format_status(execution.status)
        );
        if let Some(message) = &execution.error_message {
            println!("  {}", style(message).red());
        }
    }
    Ok(succeeded)
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = history_store().await?;

    if let Some(id) = &cmd.execution_id {
        let id = uuid::Uuid::parse_str(id).context("Invalid execution ID format")?;
        let Some(execution) = store.load_execution(id).await? else {
            println!("{} Execution not found", WARN);
            return Ok(false);
        };
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&execution.report())?);
            return Ok(true);
        }
        println!("{} Execution {}", INFO, style(execution.execution_id).cyan());
        println!("  Pipeline: {}", style(&execution.pipeline_name).bold());
        println!("  Status: {}", format_status(execution.status));
        println!(
            "  Created: {}",
            style(execution.created_at.to_rfc3339()).dim()
        );
        if let (Some(start), Some(end)) = (execution.started_at, execution.completed_at) {
            if let Ok(duration) = end.signed_duration_since(start).to_std() {
                println!("  Duration: {}", style(format_duration(duration)).dim());
            }
        }
        for (stage, nodes) in execution.stages.iter().enumerate() {
            println!("  Stage {}:", stage + 1);
            for id in nodes {
                if let Some(node) = execution.node(id) {
                    println!("    {} {}", format_node_status(node.status), node.node_name);
                }
            }
        }
        if let Some(message) = &execution.error_message {
            println!("  Error: {}", style(message).red());
        }
        return Ok(true);
    }

    let executions = store
        .list_executions(cmd.pipeline.as_deref(), cmd.limit)
        .await?;
    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }
    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(true);
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }
    Ok(true)
}

async fn show_logs(cmd: &LogsCommand, config: &EngineConfig) -> Result<bool> {
    let level = cmd
        .level
        .as_deref()
        .map(str::parse::<LogLevel>)
        .transpose()?;
    let streamer = LogStreamer::new(config.logging.clone());
    let entries = streamer
        .query(HistoryQuery {
            pipeline_id: cmd.pipeline.clone(),
            step_id: cmd.step.clone(),
            level,
            limit: cmd.limit,
            ..HistoryQuery::default()
        })
        .await?;

    if entries.is_empty() {
        println!("{} No log entries found", INFO);
    }
    for entry in &entries {
        println!("{}", format_log_entry(entry));
    }
    Ok(true)
}
