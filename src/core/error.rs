//! Error taxonomy shared across the engine

use thiserror::Error;

/// Errors raised by pipeline model, execution and log operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Node or engine configuration is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Graph shape prevents staging (cycle, dangling reference, duplicate edge)
    #[error("structural error: {0}")]
    Structural(String),

    /// A step exceeded its allotted time
    #[error("timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// A step ran but failed (non-zero exit, HTTP >= 400, failed check)
    #[error("execution error: {0}")]
    Execution(String),

    /// Work was aborted on request
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Short machine-readable kind, used in log metadata
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Structural(_) => "structural",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Execution(_) => "execution",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Io(_) => "io",
            PipelineError::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
