//! The port through which execution components emit log lines

use crate::logging::entry::LogLevel;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Destination for log lines produced while running pipelines
///
/// Implementations must not block; the executor calls this from reader
/// tasks for every line of process output.
pub trait LogSink: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        step_id: Option<&str>,
        pipeline_id: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
    );
}

/// Forwards to `tracing`, used when no streamer is running
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        step_id: Option<&str>,
        pipeline_id: Option<&str>,
        _metadata: Option<HashMap<String, Value>>,
    ) {
        let step = step_id.unwrap_or("-");
        let pipeline = pipeline_id.unwrap_or("-");
        match level {
            LogLevel::Debug => tracing::debug!(source, pipeline, step, "{}", message),
            LogLevel::Info => tracing::info!(source, pipeline, step, "{}", message),
            LogLevel::Warning => tracing::warn!(source, pipeline, step, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(source, pipeline, step, "{}", message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(
        &self,
        _level: LogLevel,
        _source: &str,
        _message: &str,
        _step_id: Option<&str>,
        _pipeline_id: Option<&str>,
        _metadata: Option<HashMap<String, Value>>,
    ) {
    }
}

/// A sink bound to one source, pipeline and step
#[derive(Clone)]
pub struct ScopedLogger {
    sink: Arc<dyn LogSink>,
    source: String,
    pipeline_id: Option<String>,
    step_id: Option<String>,
}

impl ScopedLogger {
    pub fn new(sink: Arc<dyn LogSink>, source: impl Into<String>) -> Self {
        Self {
            sink,
            source: source.into(),
            pipeline_id: None,
            step_id: None,
        }
    }

    pub fn for_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.sink.log(
            level,
            &self.source,
            message,
            self.step_id.as_deref(),
            self.pipeline_id.as_deref(),
            None,
        );
    }

    pub fn log_with(&self, level: LogLevel, message: &str, metadata: HashMap<String, Value>) {
        self.sink.log(
            level,
            &self.source,
            message,
            self.step_id.as_deref(),
            self.pipeline_id.as_deref(),
            Some(metadata),
        );
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

impl std::fmt::Debug for ScopedLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLogger")
            .field("source", &self.source)
            .field("pipeline_id", &self.pipeline_id)
            .field("step_id", &self.step_id)
            .finish()
    }
}
