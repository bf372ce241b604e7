//! Pipeline node model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default node timeout in seconds
pub const DEFAULT_NODE_TIMEOUT_SECS: i64 = 300;

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Checks out source code
    Source,
    /// Compiles or packages the project
    Build,
    /// Runs the test suite
    Test,
    /// Ships artifacts to an environment
    Deploy,
    /// Sends a message to people or systems
    Notification,
    /// Evaluates an expression and selects a branch
    Condition,
    /// Groups nodes that run side by side
    Parallel,
    /// Groups nodes that run one after another
    Sequential,
}

impl NodeType {
    pub const ALL: [NodeType; 8] = [
        NodeType::Source,
        NodeType::Build,
        NodeType::Test,
        NodeType::Deploy,
        NodeType::Notification,
        NodeType::Condition,
        NodeType::Parallel,
        NodeType::Sequential,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Build => "build",
            NodeType::Test => "test",
            NodeType::Deploy => "deploy",
            NodeType::Notification => "notification",
            NodeType::Condition => "condition",
            NodeType::Parallel => "parallel",
            NodeType::Sequential => "sequential",
        }
    }

    /// Grouping nodes carry no work of their own
    pub fn is_grouping(&self) -> bool {
        matches!(self, NodeType::Parallel | NodeType::Sequential)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout hint for editors; ignored by execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    pub name: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Type-specific settings; see the validator rule tables for keys
    #[serde(default)]
    pub config: HashMap<String, Value>,

    #[serde(default)]
    pub position: Position,

    /// Ids of upstream nodes, maintained by `Pipeline::connect`/`disconnect`
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Seconds; kept signed so that bad documents survive loading and get reported
    #[serde(default = "default_timeout")]
    pub timeout: i64,

    /// Extra attempts allowed after the first failure
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_timeout() -> i64 {
    DEFAULT_NODE_TIMEOUT_SECS
}

impl Node {
    /// Create a node with a fresh id and default settings
    pub fn new(node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            node_type,
            config: HashMap::new(),
            position: Position::default(),
            dependencies: Vec::new(),
            timeout: DEFAULT_NODE_TIMEOUT_SECS,
            retry_count: 0,
            continue_on_error: false,
            environment: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Timeout as a duration, never shorter than one second
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1) as u64)
    }

    /// String config value; empty strings count as absent
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(Value::as_f64)
    }

    /// List of strings; non-string items are ignored
    pub fn config_list(&self, key: &str) -> Vec<String> {
        self.config
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// String map; non-string values are rendered as JSON
    pub fn config_map(&self, key: &str) -> HashMap<String, String> {
        self.config
            .get(key)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_defaults() {
        let node = Node::new(NodeType::Build, "compile");
        assert_eq!(node.timeout, 300);
        assert_eq!(node.retry_count, 0);
        assert!(!node.continue_on_error);
        assert!(Uuid::parse_str(&node.id).is_ok());
    }

    #[test]
    fn test_node_type_serializes_lowercase() {
        let value = serde_json::to_value(NodeType::Notification).unwrap();
        assert_eq!(value, json!("notification"));
        let parsed: NodeType = serde_json::from_value(json!("deploy")).unwrap();
        assert_eq!(parsed, NodeType::Deploy);
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::new(NodeType::Test, "unit")
            .with_id("t1")
            .with_config("test_command", "cargo test")
            .with_position(10.0, 20.0);
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], json!("test"));
        assert_eq!(value["config"]["test_command"], json!("cargo test"));
        assert_eq!(value["position"]["x"], json!(10.0));

        let missing_defaults: Node = serde_json::from_value(json!({
            "id": "n", "name": "n", "type": "build"
        }))
        .unwrap();
        assert_eq!(missing_defaults.timeout, 300);
        assert!(missing_defaults.dependencies.is_empty());
    }

    #[test]
    fn test_config_accessors() {
        let node = Node::new(NodeType::Build, "b")
            .with_config("build_command", "  ")
            .with_config("artifacts", json!(["dist/*", 3, "out/*.tar"]))
            .with_config("environment", json!({"A": "1", "B": 2}));
        assert_eq!(node.config_str("build_command"), None);
        assert_eq!(node.config_list("artifacts"), vec!["dist/*", "out/*.tar"]);
        let env = node.config_map("environment");
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_timeout_duration_floor() {
        let node = Node::new(NodeType::Build, "b").with_timeout(0);
        assert_eq!(node.timeout_duration(), Duration::from_secs(1));
    }
}
