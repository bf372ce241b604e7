//! Step descriptors and results - the contract between the orchestrator and
//! whatever actually runs the work

use crate::core::{ExecutionContext, PipelineError};
use crate::execution::cancel::CancelSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Bash,
    Sh,
    Python,
    Node,
    Powershell,
}

impl ScriptLanguage {
    /// Program and leading arguments used to run a script file
    pub fn interpreter(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ScriptLanguage::Bash => ("bash", &[]),
            ScriptLanguage::Sh => ("sh", &[]),
            ScriptLanguage::Python => ("python3", &[]),
            ScriptLanguage::Node => ("node", &[]),
            ScriptLanguage::Powershell => ("pwsh", &["-NoProfile", "-File"]),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ScriptLanguage::Bash | ScriptLanguage::Sh => ".sh",
            ScriptLanguage::Python => ".py",
            ScriptLanguage::Node => ".js",
            ScriptLanguage::Powershell => ".ps1",
        }
    }
}

impl std::str::FromStr for ScriptLanguage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bash" => Ok(ScriptLanguage::Bash),
            "sh" | "shell" => Ok(ScriptLanguage::Sh),
            "python" | "python3" => Ok(ScriptLanguage::Python),
            "node" | "javascript" | "js" => Ok(ScriptLanguage::Node),
            "powershell" | "pwsh" => Ok(ScriptLanguage::Powershell),
            other => Err(PipelineError::Configuration(format!(
                "unsupported script language '{}'",
                other
            ))),
        }
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Shell command line
    Command { command: String },
    /// Script body written to a temporary file and run by its interpreter
    Script {
        language: ScriptLanguage,
        source: String,
    },
    /// Working directory and artifacts of the descriptor stay on the host;
    /// `workdir` is the path inside the container
    Container {
        image: String,
        command: String,
        #[serde(default)]
        volumes: Vec<String>,
        #[serde(default)]
        workdir: Option<String>,
    },
    Http {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Command { .. } => "command",
            StepKind::Script { .. } => "script",
            StepKind::Container { .. } => "container",
            StepKind::Http { .. } => "http",
        }
    }
}

/// One unit of work handed to a [`StepRunner`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub pipeline_id: Option<String>,
    pub kind: StepKind,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    /// Glob patterns, relative to the working directory
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub timeout: Duration,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            pipeline_id: None,
            kind,
            environment: HashMap::new(),
            working_directory: None,
            artifacts: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn command(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Command {
                command: command.into(),
            },
        )
    }

    pub fn for_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_env(mut self, environment: HashMap<String, String>) -> Self {
        self.environment.extend(environment);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_artifacts(mut self, patterns: Vec<String>) -> Self {
        self.artifacts = patterns;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Summary attached to every result, whatever the outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub duration_seconds: f64,
    pub exit_code: Option<i32>,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub artifacts_count: usize,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub http_status: Option<u16>,
    /// Captured stdout, or the response body for HTTP steps
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<PathBuf>,
    pub metrics: StepMetrics,
    pub error: Option<PipelineError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    /// Result with no output, used for outcomes decided before anything ran
    pub fn empty(
        step_id: impl Into<String>,
        status: StepStatus,
        error: Option<PipelineError>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status,
            exit_code: None,
            http_status: None,
            stdout: String::new(),
            stderr: String::new(),
            artifacts: Vec::new(),
            metrics: StepMetrics::default(),
            error,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn succeeded(step_id: impl Into<String>, stdout: impl Into<String>) -> Self {
        let mut result = Self::empty(step_id, StepStatus::Succeeded, None);
        result.stdout = stdout.into();
        result.exit_code = Some(0);
        result.metrics.exit_code = Some(0);
        result.metrics.stdout_lines = result.stdout.lines().count();
        result
    }

    pub fn failed(step_id: impl Into<String>, error: PipelineError) -> Self {
        Self::empty(step_id, StepStatus::Failed, Some(error))
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Runs step descriptors; the orchestrator only talks to this trait
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step`, substituting `${NAME}` placeholders from `ctx`
    ///
    /// Failures are reported through the result's status, never as a panic
    /// or an early return.
    async fn run(
        &self,
        step: &StepDescriptor,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> StepResult;
}
