//! One execution strategy per node type
//!
//! Each strategy turns a node's configuration into step descriptors, runs
//! them through the [`StepRunner`] and maps the results to node outputs.

use crate::config::ExecutorConfig;
use crate::core::{Condition, ExecutionContext, Node, NodeType, PipelineError};
use crate::execution::cancel::CancelSignal;
use crate::execution::step::{StepDescriptor, StepKind, StepResult, StepRunner, StepStatus};
use crate::logging::ScopedLogger;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::time::Instant;

const CONTAINER_WORKSPACE: &str = "/workspace";

fn default_coverage_regex() -> &'static Regex {
    static COVERAGE: OnceLock<Regex> = OnceLock::new();
    COVERAGE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)%\s*coverage|coverage[:\s]+(\d+(?:\.\d+)?)%")
            .expect("valid regex")
    })
}

/// Everything a strategy needs besides the node itself
pub(crate) struct NodeEnv<'a> {
    pub runner: &'a dyn StepRunner,
    pub config: &'a ExecutorConfig,
    pub logger: &'a ScopedLogger,
    pub pipeline_id: &'a str,
    pub workspace: &'a Path,
    pub deadline: Instant,
    pub cancel: &'a CancelSignal,
}

impl NodeEnv<'_> {
    async fn run_step(&self, step: StepDescriptor, ctx: &ExecutionContext) -> StepResult {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let step = step.for_pipeline(self.pipeline_id).with_timeout(remaining);
        self.runner.run(&step, ctx, self.cancel).await
    }

    fn dir(&self, relative: Option<&str>) -> PathBuf {
        match relative {
            Some(rel) if Path::new(rel).is_absolute() => PathBuf::from(rel),
            Some(rel) => self.workspace.join(rel),
            None => self.workspace.to_path_buf(),
        }
    }
}

/// Result of one attempt at a node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: StepStatus,
    pub outputs: HashMap<String, Value>,
    pub logs: Vec<String>,
    pub error: Option<PipelineError>,
}

impl NodeOutcome {
    fn completed(outputs: HashMap<String, Value>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            outputs,
            logs: Vec::new(),
            error: None,
        }
    }

    fn rejected(error: PipelineError) -> Self {
        Self {
            status: StepStatus::Failed,
            outputs: HashMap::new(),
            logs: Vec::new(),
            error: Some(error),
        }
    }

    fn from_step(result: &StepResult) -> Self {
        let logs = result
            .stdout
            .lines()
            .chain(result.stderr.lines())
            .map(String::from)
            .collect();
        Self {
            status: result.status,
            outputs: HashMap::new(),
            logs,
            error: result.error.clone(),
        }
    }

    fn with_output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    /// Only execution failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.status == StepStatus::Failed
            && !matches!(self.error, Some(PipelineError::Configuration(_)))
    }
}

fn required<'n>(node: &'n Node, key: &str) -> Result<&'n str, PipelineError> {
    node.config_str(key).ok_or_else(|| {
        PipelineError::Configuration(format!("node '{}' is missing '{}'", node.name, key))
    })
}

/// Single-quote for `sh -c`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn node_environment(node: &Node) -> HashMap<String, String> {
    let mut environment = node.environment.clone();
    environment.extend(node.config_map("environment"));
    environment
}

/// Run `node` once
pub(crate) async fn run_node(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> NodeOutcome {
    let outcome = match node.node_type {
        NodeType::Source => source(env, node, ctx).await,
        NodeType::Build => build(env, node, ctx).await,
        NodeType::Test => test(env, node, ctx).await,
        NodeType::Deploy => deploy(env, node, ctx).await,
        NodeType::Notification => notification(env, node, ctx).await,
        NodeType::Condition => condition(node, ctx),
        NodeType::Parallel | NodeType::Sequential => Ok(NodeOutcome::completed(HashMap::new())),
    };
    outcome.unwrap_or_else(NodeOutcome::rejected)
}

fn clone_url(config: &ExecutorConfig, node: &Node) -> Result<String, PipelineError> {
    let url = match node.config_str("clone_url") {
        Some(url) => url.to_string(),
        None => {
            let repository = required(node, "repository")?;
            format!(
                "{}/{}.git",
                config.git_base_url.trim_end_matches('/'),
                repository.trim_end_matches(".git")
            )
        }
    };
    Ok(match (node.config_str("token"), url.strip_prefix("https://")) {
        (Some(token), Some(rest)) => format!("https://x-access-token:{}@{}", token, rest),
        _ => url,
    })
}

async fn source(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, PipelineError> {
    let url = ctx.substitute(&clone_url(env.config, node)?);
    let branch = node.config_str("branch").unwrap_or("main");
    let checkout = env.dir(Some(node.config_str("checkout_path").unwrap_or("source")));

    // a retry starts from a clean checkout
    match tokio::fs::remove_dir_all(&checkout).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PipelineError::from(e)),
    }

    let mut command = format!("git clone --branch {}", shell_quote(&ctx.substitute(branch)));
    if let Some(depth) = node.config_u64("depth") {
        command.push_str(&format!(" --depth {}", depth));
    }
    if node.config_bool("submodules") == Some(true) {
        command.push_str(" --recurse-submodules");
    }
    command.push_str(&format!(
        " {} {}",
        shell_quote(&url),
        shell_quote(&checkout.display().to_string())
    ));

    env.logger.info(&format!(
        "Cloning {} ({})",
        node.config_str("repository").unwrap_or("repository"),
        branch
    ));
    let step = StepDescriptor::command(&node.id, command)
        .in_dir(env.workspace)
        .with_env(node_environment(node));
    let result = env.run_step(step, ctx).await;

    let mut outcome = NodeOutcome::from_step(&result);
    if result.is_success() {
        outcome = outcome.with_output("source_path", checkout.display().to_string());
    }
    Ok(outcome)
}

/// Command step, or a container step when the node names an image
fn command_step(
    env: &NodeEnv<'_>,
    node: &Node,
    command: &str,
    dir_key: Option<&str>,
) -> StepDescriptor {
    let image = node.config_str("image");
    // with an image, working_directory names a path inside the container
    let relative = dir_key.and_then(|key| node.config_str(key));
    let host_dir = match image {
        Some(_) => env.dir(relative),
        None => env.dir(relative.or(node.config_str("working_directory"))),
    };
    let kind = match image {
        Some(image) => {
            let mut volumes = node.config_list("volumes");
            if volumes.is_empty() {
                volumes.push(format!("{}:{}", env.workspace.display(), CONTAINER_WORKSPACE));
            }
            StepKind::Container {
                image: image.to_string(),
                command: command.to_string(),
                volumes,
                workdir: Some(
                    node.config_str("working_directory")
                        .unwrap_or(CONTAINER_WORKSPACE)
                        .to_string(),
                ),
            }
        }
        None => StepKind::Command {
            command: command.to_string(),
        },
    };
    StepDescriptor::new(&node.id, kind)
        .in_dir(host_dir)
        .with_env(node_environment(node))
        .with_artifacts(node.config_list("artifacts"))
}

fn artifact_list(result: &StepResult) -> Value {
    Value::Array(
        result
            .artifacts
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect(),
    )
}

async fn build(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, PipelineError> {
    let command = required(node, "build_command")?;
    let step = command_step(env, node, command, Some("build_path"));
    let result = env.run_step(step, ctx).await;

    Ok(NodeOutcome::from_step(&result)
        .with_output("build_artifacts", artifact_list(&result))
        .with_output("exit_code", json!(result.exit_code)))
}

/// Coverage percentage reported in `output`, if any
pub(crate) fn parse_coverage(output: &str, pattern: Option<&Regex>) -> Option<f64> {
    let regex: &Regex = match pattern {
        Some(pattern) => pattern,
        None => default_coverage_regex(),
    };
    regex.captures_iter(output).last().and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .and_then(|m| m.as_str().parse().ok())
    })
}

async fn test(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, PipelineError> {
    let command = required(node, "test_command")?;
    let custom_pattern = match node.config_str("coverage_pattern") {
        Some(p) => Some(Regex::new(p).map_err(|e| {
            PipelineError::Configuration(format!("invalid coverage_pattern: {}", e))
        })?),
        None => None,
    };

    let step = command_step(env, node, command, Some("test_path"));
    let result = env.run_step(step, ctx).await;
    let mut outcome = NodeOutcome::from_step(&result);

    let coverage = parse_coverage(&result.stdout, custom_pattern.as_ref());
    let threshold = node.config_f64("coverage_threshold");
    if result.is_success() {
        match (threshold, coverage) {
            (Some(threshold), Some(coverage)) if coverage < threshold => {
                outcome.status = StepStatus::Failed;
                outcome.error = Some(PipelineError::Execution(format!(
                    "coverage {:.1}% is below the threshold of {:.1}%",
                    coverage, threshold
                )));
            }
            (Some(_), None) => {
                env.logger
                    .warn("Coverage threshold set but the test output reported no coverage");
            }
            _ => {}
        }
    }

    let passed = outcome.status == StepStatus::Succeeded;
    Ok(outcome.with_output(
        "test_results",
        json!({
            "passed": passed,
            "exit_code": result.exit_code,
            "coverage": coverage,
            "artifacts": artifact_list(&result),
        }),
    ))
}

async fn deploy(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, PipelineError> {
    let target = required(node, "target_environment")?;
    let command = required(node, "deploy_command")?;
    env.logger.info(&format!("Deploying to {}", target));

    let step = command_step(env, node, command, None);
    let result = env.run_step(step, ctx).await;
    let mut outcome = NodeOutcome::from_step(&result).with_output("target_environment", target);
    if !result.is_success() {
        return Ok(outcome);
    }

    let health_url = node.config_str("health_check_url").map(|u| ctx.substitute(u));
    if let Some(url) = &health_url {
        let check = StepDescriptor::new(
            format!("{}-health", node.id),
            StepKind::Http {
                method: "GET".to_string(),
                url: url.clone(),
                headers: HashMap::new(),
                body: None,
            },
        );
        let health = env.run_step(check, ctx).await;
        if !health.is_success() {
            outcome.status = health.status;
            outcome.error = Some(PipelineError::Execution(format!(
                "health check {} failed: {}",
                url,
                health.error_message().unwrap_or_default()
            )));
        }
    }
    Ok(outcome.with_output("deployment_url", json!(health_url)))
}

async fn notification(
    env: &NodeEnv<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeOutcome, PipelineError> {
    let template = node
        .config_str("message_template")
        .unwrap_or("Pipeline ${PIPELINE_NAME} notification from ${NODE_NAME}");
    let message = ctx.substitute(template);
    let recipients = node.config_list("recipients");
    let kind = node.config_str("notification_type").unwrap_or("webhook");

    let Some(webhook) = node.config_str("webhook_url") else {
        env.logger
            .info(&format!("[{}] {} -> {}", kind, message, recipients.join(", ")));
        return Ok(NodeOutcome::completed(HashMap::new()).with_output("notified", true));
    };

    let step = StepDescriptor::new(
        &node.id,
        StepKind::Http {
            method: "POST".to_string(),
            url: webhook.to_string(),
            headers: HashMap::new(),
            body: Some(json!({
                "type": kind,
                "message": message,
                "recipients": recipients,
                "pipeline": ctx.get("PIPELINE_NAME"),
                "execution_id": ctx.get("EXECUTION_ID"),
            })),
        },
    );
    let result = env.run_step(step, ctx).await;
    let notified = result.is_success();
    Ok(NodeOutcome::from_step(&result).with_output("notified", notified))
}

fn condition(node: &Node, ctx: &ExecutionContext) -> Result<NodeOutcome, PipelineError> {
    let expression = required(node, "condition_expression")?;
    let result = Condition::parse(expression)?
        .evaluate(ctx)
        .map_err(|e| PipelineError::Configuration(e.to_string()))?;
    let branch = if result { "true_branch" } else { "false_branch" };

    let mut outcome =
        NodeOutcome::completed(HashMap::new()).with_output("condition_result", result);
    if let Some(selected) = node.config_str(branch) {
        outcome = outcome.with_output("selected_branch", selected);
    }
    Ok(outcome)
}

/// Whether `dependent` sits on the branch a finished condition node did not take
pub(crate) fn branch_not_taken(
    condition: &Node,
    outputs: &HashMap<String, Value>,
    dependent: &Node,
) -> bool {
    let Some(result) = outputs.get("condition_result").and_then(Value::as_bool) else {
        return false;
    };
    let other = if result { "false_branch" } else { "true_branch" };
    let names = |key: &str| {
        condition
            .config_str(key)
            .is_some_and(|b| b == dependent.id || b == dependent.name)
    };
    names(other) && !names(if result { "true_branch" } else { "false_branch" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        steps: Mutex<Vec<StepDescriptor>>,
        stdout: String,
    }

    #[async_trait]
    impl StepRunner for Recorder {
        async fn run(
            &self,
            step: &StepDescriptor,
            _ctx: &ExecutionContext,
            _cancel: &CancelSignal,
        ) -> StepResult {
            self.steps.lock().unwrap().push(step.clone());
            StepResult::succeeded(&step.id, self.stdout.clone())
        }
    }

    async fn run_with(recorder: &Recorder, node: &Node) -> NodeOutcome {
        let config = ExecutorConfig::default();
        let logger = ScopedLogger::new(Arc::new(NullSink), "test");
        let cancel = CancelSignal::new();
        let env = NodeEnv {
            runner: recorder,
            config: &config,
            logger: &logger,
            pipeline_id: "p1",
            workspace: Path::new("/tmp/ws"),
            deadline: Instant::now() + Duration::from_secs(60),
            cancel: &cancel,
        };
        let mut ctx = ExecutionContext::new();
        ctx.set("PIPELINE_NAME", "demo");
        run_node(&env, node, &ctx).await
    }

    #[tokio::test]
    async fn test_source_builds_clone_command() {
        let recorder = Recorder::default();
        let node = Node::new(NodeType::Source, "checkout")
            .with_config("repository", "acme/app")
            .with_config("branch", "develop")
            .with_config("depth", 1);
        let outcome = run_with(&recorder, &node).await;
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.outputs["source_path"], "/tmp/ws/source");

        let steps = recorder.steps.lock().unwrap();
        let StepKind::Command { command } = &steps[0].kind else {
            panic!("expected a command step");
        };
        assert_eq!(
            command,
            "git clone --branch 'develop' --depth 1 'https://github.com/acme/app.git' '/tmp/ws/source'"
        );
        assert_eq!(steps[0].pipeline_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_build_in_image_uses_container() {
        let recorder = Recorder::default();
        let node = Node::new(NodeType::Build, "build")
            .with_config("build_command", "cargo build")
            .with_config("image", "rust:1.80");
        run_with(&recorder, &node).await;

        let steps = recorder.steps.lock().unwrap();
        match &steps[0].kind {
            StepKind::Container { image, volumes, workdir, .. } => {
                assert_eq!(image, "rust:1.80");
                assert_eq!(volumes, &vec!["/tmp/ws:/workspace".to_string()]);
                assert_eq!(workdir.as_deref(), Some("/workspace"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_required_field_is_not_retryable() {
        let recorder = Recorder::default();
        let outcome = run_with(&recorder, &Node::new(NodeType::Build, "build")).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(!outcome.is_retryable());
        assert!(recorder.steps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coverage_below_threshold_fails() {
        let recorder = Recorder {
            stdout: "12 passed\nTotal coverage: 72.5%".to_string(),
            ..Default::default()
        };
        let node = Node::new(NodeType::Test, "test")
            .with_config("test_command", "make test")
            .with_config("coverage_threshold", 80);
        let outcome = run_with(&recorder, &node).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.is_retryable());
        assert_eq!(outcome.outputs["test_results"]["coverage"], 72.5);
    }

    #[test]
    fn test_parse_coverage_forms() {
        assert_eq!(parse_coverage("85% coverage", None), Some(85.0));
        assert_eq!(parse_coverage("coverage: 91.2%", None), Some(91.2));
        assert_eq!(parse_coverage("no numbers here", None), None);
        let custom = Regex::new(r"lines\.+: (\d+)").unwrap();
        assert_eq!(parse_coverage("lines......: 64", Some(&custom)), Some(64.0));
    }

    #[tokio::test]
    async fn test_deploy_runs_health_check() {
        let recorder = Recorder::default();
        let node = Node::new(NodeType::Deploy, "deploy")
            .with_config("target_environment", "staging")
            .with_config("deploy_command", "./deploy.sh")
            .with_config("health_check_url", "https://staging.example.com/health");
        let outcome = run_with(&recorder, &node).await;
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.outputs["target_environment"], "staging");

        let steps = recorder.steps.lock().unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(&steps[1].kind, StepKind::Http { method, .. } if method == "GET"));
    }

    #[tokio::test]
    async fn test_notification_without_webhook_only_logs() {
        let recorder = Recorder::default();
        let node = Node::new(NodeType::Notification, "notify")
            .with_config("notification_type", "slack")
            .with_config("recipients", json!(["#builds"]));
        let outcome = run_with(&recorder, &node).await;
        assert_eq!(outcome.outputs["notified"], true);
        assert!(recorder.steps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_condition_selects_branch() {
        let recorder = Recorder::default();
        let gate = Node::new(NodeType::Condition, "gate")
            .with_config("condition_expression", "${PIPELINE_NAME} == 'demo'")
            .with_config("true_branch", "deploy")
            .with_config("false_branch", "notify");
        let outcome = run_with(&recorder, &gate).await;
        assert_eq!(outcome.outputs["condition_result"], true);
        assert_eq!(outcome.outputs["selected_branch"], "deploy");

        let deploy = Node::new(NodeType::Deploy, "deploy");
        let notify = Node::new(NodeType::Notification, "notify");
        assert!(!branch_not_taken(&gate, &outcome.outputs, &deploy));
        assert!(branch_not_taken(&gate, &outcome.outputs, &notify));
    }
}
