//! Engine configuration
//!
//! Loaded from YAML; every field has a default so an empty file (or no
//! file at all) gives a working engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pipeline-engine")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub logging: LogConfig,
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("Failed to parse engine config")
    }

    /// Read `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_pipelines: usize,
    pub max_concurrent_nodes: usize,
    /// Fallback admission tick; submissions also wake the scheduler directly
    pub poll_interval_ms: u64,
    /// How long terminal executions stay queryable
    pub retention_secs: u64,
    pub reaper_interval_secs: u64,
    /// Retry `n` waits `base * 2^n`
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_secs: u64,
    /// Per-observer event queue length
    pub event_channel_capacity: usize,
    pub workspace_dir: PathBuf,
    /// Delete an execution's workspace when it is reaped
    pub cleanup_workspaces: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: 5,
            max_concurrent_nodes: 10,
            poll_interval_ms: 1000,
            retention_secs: 3600,
            reaper_interval_secs: 60,
            retry_backoff_base_ms: 1000,
            retry_backoff_cap_secs: 60,
            event_channel_capacity: 256,
            workspace_dir: data_dir().join("workspaces"),
            cleanup_workspaces: true,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^attempt`, capped
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let delay = self.retry_backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay).min(Duration::from_secs(self.retry_backoff_cap_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub shell: String,
    pub container_runtime: String,
    /// Time between SIGTERM and SIGKILL
    pub termination_grace_secs: u64,
    /// Prefix for `owner/name` repositories without an explicit clone URL
    pub git_base_url: String,
    /// Output lines kept on a node execution
    pub max_captured_lines: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            container_runtime: "docker".to_string(),
            termination_grace_secs: 5,
            git_base_url: "https://github.com".to_string(),
            max_captured_lines: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub buffer_capacity: usize,
    pub stream_queue_capacity: usize,
    pub heartbeat_secs: u64,
    pub retention_days: u64,
    pub purge_interval_secs: u64,
    pub compression: bool,
    pub max_file_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: data_dir().join("logs"),
            buffer_capacity: 10_000,
            stream_queue_capacity: 1000,
            heartbeat_secs: 30,
            retention_days: 7,
            purge_interval_secs: 3600,
            compression: false,
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

impl LogConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}
