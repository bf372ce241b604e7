//! Log entries and subscriber filters

use crate::core::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Source name used for synthetic stream entries
pub const STREAM_SOURCE: &str = "streamer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(PipelineError::Configuration(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// One record on the log bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Assigned by the streamer; orders entries sharing a timestamp
    #[serde(default)]
    pub sequence: u64,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            step_id: None,
            pipeline_id: None,
            metadata: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(LogLevel::Debug, STREAM_SOURCE, "heartbeat")
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.source == STREAM_SOURCE && self.message == "heartbeat"
    }

    /// Identity used when merging buffer and file results
    pub(crate) fn dedup_key(&self) -> (DateTime<Utc>, String, String) {
        (self.timestamp, self.source.clone(), self.message.clone())
    }
}

/// Conjunction of optional constraints; an absent field matches anything
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub levels: Option<HashSet<LogLevel>>,
    pub sources: Option<HashSet<String>>,
    pub step_ids: Option<HashSet<String>>,
    pub pipeline_ids: Option<HashSet<String>>,
    pub message_pattern: Option<Regex>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn levels(mut self, levels: impl IntoIterator<Item = LogLevel>) -> Self {
        self.levels = Some(levels.into_iter().collect());
        self
    }

    pub fn sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn step_ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.step_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn pipeline_ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.pipeline_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Case-insensitive regex over the message
    pub fn message_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("invalid message pattern: {}", e)))?;
        self.message_pattern = Some(regex);
        Ok(self)
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        fn contains(set: &Option<HashSet<String>>, value: Option<&str>) -> bool {
            match set {
                None => true,
                Some(set) => value.is_some_and(|v| set.contains(v)),
            }
        }

        if let Some(levels) = &self.levels {
            if !levels.contains(&entry.level) {
                return false;
            }
        }
        if !contains(&self.sources, Some(entry.source.as_str())) {
            return false;
        }
        if !contains(&self.step_ids, entry.step_id.as_deref()) {
            return false;
        }
        if !contains(&self.pipeline_ids, entry.pipeline_id.as_deref()) {
            return false;
        }
        match &self.message_pattern {
            Some(pattern) => pattern.is_match(&entry.message),
            None => true,
        }
    }
}

/// Parameters of a historical query
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub pipeline_id: Option<String>,
    pub step_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub level: Option<LogLevel>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            pipeline_id: None,
            step_id: None,
            start: None,
            end: None,
            level: None,
            limit: 1000,
        }
    }
}

impl HistoryQuery {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(pipeline_id) = &self.pipeline_id {
            if entry.pipeline_id.as_ref() != Some(pipeline_id) {
                return false;
            }
        }
        if let Some(step_id) = &self.step_id {
            if entry.step_id.as_ref() != Some(step_id) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if self.start.is_some_and(|start| entry.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| entry.timestamp > end) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LogEntry {
        LogEntry::new(LogLevel::Warning, "executor", "Disk usage HIGH")
            .with_step("build")
            .with_pipeline("p1")
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(LogFilter::new().matches(&entry()));
    }

    #[test]
    fn test_filter_fields_are_conjunctive() {
        let filter = LogFilter::new()
            .levels([LogLevel::Warning, LogLevel::Error])
            .sources(["executor"])
            .pipeline_ids(["p1"]);
        assert!(filter.matches(&entry()));

        let wrong_step = filter.clone().step_ids(["test"]);
        assert!(!wrong_step.matches(&entry()));

        let no_step = LogEntry::new(LogLevel::Warning, "executor", "x").with_pipeline("p1");
        assert!(!LogFilter::new().step_ids(["build"]).matches(&no_step));
    }

    #[test]
    fn test_message_pattern_is_case_insensitive() {
        let filter = LogFilter::new().message_pattern("disk usage high").unwrap();
        assert!(filter.matches(&entry()));
        assert!(LogFilter::new().message_pattern("(").is_err());
    }

    #[test]
    fn test_level_parsing_and_json() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("loud".parse::<LogLevel>().is_err());
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["level"], "WARNING");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_history_query_time_window() {
        let e = entry();
        let query = HistoryQuery {
            start: Some(e.timestamp - chrono::Duration::seconds(1)),
            end: Some(e.timestamp),
            level: Some(LogLevel::Warning),
            ..Default::default()
        };
        assert!(query.matches(&e));
        let later = HistoryQuery {
            start: Some(e.timestamp + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&e));
    }
}
