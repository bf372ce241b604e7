//! Step executor - runs commands, scripts, containers and HTTP calls

use crate::config::ExecutorConfig;
use crate::core::{ExecutionContext, PipelineError};
use crate::execution::cancel::CancelSignal;
use crate::execution::process::{self, ProcessOptions, ProcessOutcome, ProcessOutput};
use crate::execution::step::{
    ScriptLanguage, StepDescriptor, StepKind, StepMetrics, StepResult, StepRunner, StepStatus,
};
use crate::logging::{LogSink, ScopedLogger};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

const LOG_SOURCE: &str = "step_executor";

/// What a single run produced before artifacts and metrics are attached
struct RunOutcome {
    status: StepStatus,
    exit_code: Option<i32>,
    http_status: Option<u16>,
    stdout: String,
    stderr: String,
    stdout_lines: usize,
    stderr_lines: usize,
    error: Option<PipelineError>,
}

impl RunOutcome {
    fn failed(error: PipelineError) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code: None,
            http_status: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_lines: 0,
            stderr_lines: 0,
            error: Some(error),
        }
    }

    fn from_process(output: ProcessOutput, timeout: Duration) -> Self {
        let exit_code = output.exit_code();
        let (status, error) = match output.outcome {
            ProcessOutcome::Exited(exit) if exit.success() => (StepStatus::Succeeded, None),
            ProcessOutcome::Exited(_) => (
                StepStatus::Failed,
                Some(PipelineError::Execution(match exit_code {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process terminated by signal".to_string(),
                })),
            ),
            ProcessOutcome::TimedOut => (
                StepStatus::TimedOut,
                Some(PipelineError::Timeout {
                    seconds: timeout.as_secs().max(1),
                }),
            ),
            ProcessOutcome::Cancelled => (
                StepStatus::Cancelled,
                Some(PipelineError::Cancelled("step cancelled".to_string())),
            ),
        };
        Self {
            status,
            exit_code,
            http_status: None,
            stdout: output.stdout.text(),
            stderr: output.stderr.text(),
            stdout_lines: output.stdout.total,
            stderr_lines: output.stderr.total,
            error,
        }
    }
}

/// Arguments for a `<runtime> run` invocation equivalent to `command` in `image`
pub fn container_args(
    image: &str,
    command: &str,
    volumes: &[String],
    environment: &HashMap<String, String>,
    working_directory: Option<&Path>,
) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];
    for volume in volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    let mut env: Vec<_> = environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(dir) = working_directory {
        args.push("-w".to_string());
        args.push(dir.display().to_string());
    }
    args.push(image.to_string());
    args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
    args
}

/// Files under `dir` matching any of `patterns`, sorted and deduplicated
pub fn collect_artifacts(dir: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for pattern in patterns {
        let full = if Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            format!("{}/{}", dir.display(), pattern)
        };
        match glob::glob(&full) {
            Ok(paths) => found.extend(paths.filter_map(|p| p.ok()).filter(|p| p.exists())),
            Err(e) => warn!("Invalid artifact pattern '{}': {}", pattern, e),
        }
    }
    found.sort();
    found.dedup();
    found
}

/// [`StepRunner`] backed by real processes and HTTP calls
pub struct StepExecutor {
    config: ExecutorConfig,
    sink: Arc<dyn LogSink>,
    http: reqwest::Client,
}

impl StepExecutor {
    pub fn new(config: ExecutorConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            sink,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one step to completion; never returns early with an error
    pub async fn execute(
        &self,
        step: &StepDescriptor,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> StepResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut logger = ScopedLogger::new(self.sink.clone(), LOG_SOURCE).for_step(&step.id);
        if let Some(pipeline_id) = &step.pipeline_id {
            logger = logger.for_pipeline(pipeline_id);
        }

        info!("Executing {} step: {}", step.kind.name(), step.id);
        let environment = ctx.substitute_map(&step.environment);
        let working_dir = step
            .working_directory
            .as_ref()
            .map(|d| PathBuf::from(ctx.substitute(&d.display().to_string())));

        let outcome = if cancel.is_cancelled() {
            RunOutcome {
                status: StepStatus::Cancelled,
                ..RunOutcome::failed(PipelineError::Cancelled("step cancelled".to_string()))
            }
        } else if step.timeout.is_zero() {
            RunOutcome {
                status: StepStatus::TimedOut,
                ..RunOutcome::failed(PipelineError::Timeout { seconds: 0 })
            }
        } else {
            match &step.kind {
                StepKind::Command { command } => {
                    let command = self.shell(&ctx.substitute(command));
                    let dir = working_dir.as_deref();
                    self.run_process(command, step, &environment, dir, cancel, &logger)
                        .await
                }
                StepKind::Script { language, source } => {
                    let source = ctx.substitute(source);
                    let dir = working_dir.as_deref();
                    self.run_script(*language, &source, step, &environment, dir, cancel, &logger)
                        .await
                }
                StepKind::Container {
                    image,
                    command,
                    volumes,
                    workdir,
                } => {
                    let volumes: Vec<String> = volumes.iter().map(|v| ctx.substitute(v)).collect();
                    let workdir = workdir.as_ref().map(|w| PathBuf::from(ctx.substitute(w)));
                    let args = container_args(
                        &ctx.substitute(image),
                        &ctx.substitute(command),
                        &volumes,
                        &environment,
                        workdir.as_deref(),
                    );
                    let mut command = Command::new(&self.config.container_runtime);
                    command.args(&args);
                    // environment reaches the container through -e
                    let dir = working_dir.as_deref();
                    self.run_process(command, step, &HashMap::new(), dir, cancel, &logger)
                        .await
                }
                StepKind::Http {
                    method,
                    url,
                    headers,
                    body,
                } => {
                    let url = ctx.substitute(url);
                    let headers = ctx.substitute_map(headers);
                    let body = body.as_ref().map(|b| ctx.substitute_value(b));
                    self.run_http(method, &url, &headers, body, step, cancel, &logger)
                        .await
                }
            }
        };

        let artifacts = match (&working_dir, step.artifacts.is_empty()) {
            (Some(dir), false) => collect_artifacts(dir, &step.artifacts),
            (None, false) => match std::env::current_dir() {
                Ok(dir) => collect_artifacts(&dir, &step.artifacts),
                Err(_) => Vec::new(),
            },
            _ => Vec::new(),
        };

        let duration = clock.elapsed().as_secs_f64();
        if let Some(error) = &outcome.error {
            logger.error(&format!("Step failed: {}", error));
        }
        debug!(
            "Step {} finished {:?} in {:.2}s",
            step.id, outcome.status, duration
        );

        StepResult {
            step_id: step.id.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            http_status: outcome.http_status,
            metrics: StepMetrics {
                duration_seconds: duration,
                exit_code: outcome.exit_code,
                stdout_lines: outcome.stdout_lines,
                stderr_lines: outcome.stderr_lines,
                artifacts_count: artifacts.len(),
                http_status: outcome.http_status,
            },
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            artifacts,
            error: outcome.error,
            started_at,
            completed_at: Utc::now(),
        }
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c").arg(command);
        cmd
    }

    async fn run_process(
        &self,
        mut command: Command,
        step: &StepDescriptor,
        environment: &HashMap<String, String>,
        working_dir: Option<&Path>,
        cancel: &CancelSignal,
        logger: &ScopedLogger,
    ) -> RunOutcome {
        command.envs(environment);
        if let Some(dir) = working_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                return RunOutcome::failed(PipelineError::Io(format!(
                    "cannot create working directory {}: {}",
                    dir.display(),
                    e
                )));
            }
            command.current_dir(dir);
        }

        let options = ProcessOptions {
            timeout: step.timeout,
            grace: self.config.termination_grace(),
            max_lines: self.config.max_captured_lines,
            cancel,
            logger,
        };
        match process::run(command, options).await {
            Ok(output) => RunOutcome::from_process(output, step.timeout),
            Err(e) => RunOutcome::failed(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_script(
        &self,
        language: ScriptLanguage,
        source: &str,
        step: &StepDescriptor,
        environment: &HashMap<String, String>,
        working_dir: Option<&Path>,
        cancel: &CancelSignal,
        logger: &ScopedLogger,
    ) -> RunOutcome {
        // removed when `script` drops, on every path out of this function
        let script = match write_script(language, source) {
            Ok(path) => path,
            Err(e) => return RunOutcome::failed(e),
        };
        let (program, leading) = language.interpreter();
        let mut command = Command::new(program);
        command.args(leading).arg(script.to_path_buf());
        let outcome = self
            .run_process(command, step, environment, working_dir, cancel, logger)
            .await;
        drop(script);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_http(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Value>,
        step: &StepDescriptor,
        cancel: &CancelSignal,
        logger: &ScopedLogger,
    ) -> RunOutcome {
        let method = match reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return RunOutcome::failed(PipelineError::Configuration(format!(
                    "invalid HTTP method '{}'",
                    method
                )))
            }
        };

        let mut request = self.http.request(method.clone(), url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match body {
            Some(Value::String(text)) => request.body(text),
            Some(json) => request.json(&json),
            None => request,
        };

        logger.info(&format!("{} {}", method, url));
        let call = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let result = tokio::select! {
            result = tokio::time::timeout(step.timeout, call) => result,
            _ = cancel.cancelled() => {
                return RunOutcome {
                    status: StepStatus::Cancelled,
                    ..RunOutcome::failed(PipelineError::Cancelled("step cancelled".to_string()))
                };
            }
        };

        match result {
            Err(_) => RunOutcome {
                status: StepStatus::TimedOut,
                ..RunOutcome::failed(PipelineError::Timeout {
                    seconds: step.timeout.as_secs().max(1),
                })
            },
            Ok(Err(e)) => RunOutcome::failed(PipelineError::Execution(format!(
                "HTTP request to {} failed: {}",
                url, e
            ))),
            Ok(Ok((status, text))) => {
                logger.info(&format!("HTTP {} from {}", status, url));
                let (step_status, error) = if status >= 400 {
                    (
                        StepStatus::Failed,
                        Some(PipelineError::Execution(format!(
                            "HTTP request returned status {}",
                            status
                        ))),
                    )
                } else {
                    (StepStatus::Succeeded, None)
                };
                RunOutcome {
                    status: step_status,
                    exit_code: None,
                    http_status: Some(status),
                    stdout_lines: text.lines().count(),
                    stdout: text,
                    stderr: String::new(),
                    stderr_lines: 0,
                    error,
                }
            }
        }
    }
}

fn write_script(language: ScriptLanguage, source: &str) -> Result<tempfile::TempPath, PipelineError> {
    let mut file = tempfile::Builder::new()
        .prefix("pipeline-step-")
        .suffix(language.extension())
        .tempfile()?;
    file.write_all(source.as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))?;
    }

    // close the handle so the interpreter can open the file
    Ok(file.into_temp_path())
}

#[async_trait]
impl StepRunner for StepExecutor {
    async fn run(
        &self,
        step: &StepDescriptor,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> StepResult {
        self.execute(step, ctx, cancel).await
    }
}
