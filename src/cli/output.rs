//! CLI output formatting

use crate::{
    core::{ExecutionStatus, NodeStatus},
    execution::ExecutionEvent,
    logging::{LogEntry, LogLevel},
    persistence::ExecutionSummary,
    validation::{PipelineValidationReport, ValidationLevel, ValidationResult},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

const DEFAULT_WIDTH: usize = 80;

/// Progress bar over the stages of an execution
pub fn create_progress_bar(total_stages: usize) -> ProgressBar {
    let progress = ProgressBar::new(total_stages as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] stage {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule as wide as the terminal
pub fn separator() -> String {
    let width = term_size::dimensions()
        .map(|(w, _)| w)
        .unwrap_or(DEFAULT_WIDTH)
        .min(120);
    style("─".repeat(width)).dim().to_string()
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Queued => style("QUEUED").blue().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_node_status(status: NodeStatus) -> String {
    match status {
        NodeStatus::Pending => style("PENDING").dim().to_string(),
        NodeStatus::Running => style("RUNNING").yellow().to_string(),
        NodeStatus::Completed => style("COMPLETED").green().to_string(),
        NodeStatus::Failed => style("FAILED").red().to_string(),
        NodeStatus::Cancelled => style("CANCELLED").yellow().to_string(),
        NodeStatus::Skipped => style("SKIPPED").dim().to_string(),
        NodeStatus::Timeout => style("TIMEOUT").red().to_string(),
    }
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running | ExecutionStatus::Queued => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} ({}/{} nodes) - {} - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.completed_nodes,
        summary.total_nodes,
        style(format!("{:.0}%", summary.progress)).cyan(),
        style(summary.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::ExecutionQueued { execution_id, .. } => {
            format!("{} Queued {}", INFO, style(short_id(execution_id)).dim())
        }
        ExecutionEvent::ExecutionStarted {
            execution_id,
            pipeline_name,
            total_stages,
            ..
        } => format!(
            "{} Starting pipeline {} ({}, {} stages)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(execution_id)).dim(),
            total_stages
        ),
        ExecutionEvent::StageStarted { stage, nodes, .. } => format!(
            "{} Stage {}: {}",
            INFO,
            stage + 1,
            style(nodes.join(", ")).cyan()
        ),
        ExecutionEvent::NodeStarted {
            node_id, attempt, ..
        } => {
            if *attempt > 1 {
                format!(
                    "{} {} (attempt {})",
                    SPINNER,
                    style(node_id).cyan(),
                    style(attempt).dim()
                )
            } else {
                format!("{} {}", SPINNER, style(node_id).cyan())
            }
        }
        ExecutionEvent::NodeRetrying {
            node_id,
            attempt,
            delay_secs,
            error,
            ..
        } => format!(
            "{} {} failed, attempt {} in {:.1}s: {}",
            WARN,
            style(node_id).yellow(),
            attempt,
            delay_secs,
            style(error).dim()
        ),
        ExecutionEvent::NodeCompleted {
            node_id,
            status,
            error,
            ..
        } => {
            let icon = match status {
                NodeStatus::Completed => CHECK,
                NodeStatus::Skipped => SKIP,
                NodeStatus::Cancelled => WARN,
                _ => CROSS,
            };
            match error {
                Some(error) if *status != NodeStatus::Completed => format!(
                    "{} {} {}: {}",
                    icon,
                    style(node_id).bold(),
                    format_node_status(*status),
                    style(error).dim()
                ),
                _ => format!("{} {} {}", icon, style(node_id).bold(), format_node_status(*status)),
            }
        }
        ExecutionEvent::ExecutionCompleted {
            execution_id,
            duration_secs,
        } => format!(
            "{} Pipeline ({}) {} in {}",
            CHECK,
            style(short_id(execution_id)).dim(),
            style("completed successfully").green(),
            format_duration(Duration::from_secs_f64(duration_secs.unwrap_or(0.0).max(0.0)))
        ),
        ExecutionEvent::ExecutionFailed {
            execution_id,
            error,
        } => format!(
            "{} Pipeline ({}) {}: {}",
            CROSS,
            style(short_id(execution_id)).dim(),
            style("failed").red(),
            error
        ),
        ExecutionEvent::ExecutionCancelled {
            execution_id,
            cancelled_by,
        } => format!(
            "{} Pipeline ({}) {} by {}",
            WARN,
            style(short_id(execution_id)).dim(),
            style("cancelled").yellow(),
            cancelled_by.as_deref().unwrap_or("unknown")
        ),
    }
}

/// One log line: time, level, where it came from, message
pub fn format_log_entry(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Debug => style(format!("{:<8}", entry.level.as_str())).dim(),
        LogLevel::Info => style(format!("{:<8}", entry.level.as_str())).green(),
        LogLevel::Warning => style(format!("{:<8}", entry.level.as_str())).yellow(),
        LogLevel::Error | LogLevel::Critical => style(format!("{:<8}", entry.level.as_str())).red(),
    };
    let origin = match &entry.step_id {
        Some(step) => format!("{}/{}", entry.source, step),
        None => entry.source.clone(),
    };
    format!(
        "{} {} {} {}",
        style(entry.timestamp.format("%H:%M:%S%.3f")).dim(),
        level,
        style(origin).cyan(),
        entry.message
    )
}

fn format_validation_result(result: &ValidationResult) -> String {
    let (icon, level) = match result.level {
        ValidationLevel::Error => (CROSS, style("error").red()),
        ValidationLevel::Warning => (WARN, style("warning").yellow()),
        ValidationLevel::Info => (INFO, style("info").blue()),
    };
    let mut line = format!("{}{}: {}", icon, level, result.message);
    if let Some(field) = &result.field {
        line.push_str(&format!(" [{}]", style(field).dim()));
    }
    if let Some(suggestion) = &result.suggestion {
        line.push_str(&format!("\n      {} {}", style("hint:").dim(), suggestion));
    }
    line
}

/// Human-readable validation report, pipeline findings first
pub fn format_validation_report(report: &PipelineValidationReport) -> String {
    let mut out = Vec::new();
    for result in &report.results {
        out.push(format!("  {}", format_validation_result(result)));
    }
    for node in &report.nodes {
        if node.results.is_empty() {
            continue;
        }
        out.push(format!(
            "  {} ({})",
            style(&node.node_name).bold(),
            style(node.node_type.as_str()).dim()
        ));
        for result in &node.results {
            out.push(format!("    {}", format_validation_result(result)));
        }
    }
    out.push(format!(
        "  {} errors, {} warnings, {} info",
        style(report.summary.errors).red(),
        style(report.summary.warnings).yellow(),
        style(report.summary.infos).blue()
    ));
    out.join("\n")
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[test]
    fn test_log_entry_includes_step() {
        let entry = LogEntry::new(LogLevel::Info, "executor", "compiling").with_step("build");
        let line = console::strip_ansi_codes(&format_log_entry(&entry)).to_string();
        assert!(line.contains("executor/build"));
        assert!(line.ends_with("compiling"));
    }
}
