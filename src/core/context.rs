//! Execution context - variables available to `${NAME}` placeholders and
//! condition expressions

use crate::core::node::Node;
use crate::core::pipeline::Pipeline;
use crate::core::state::Execution;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("valid regex")
    })
}

/// Flat name -> value map seen by one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    variables: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context for `node`
    ///
    /// Later layers win: pipeline variables, execution overrides, node
    /// environment, built-ins, then dependency outputs as `<dep>.<key>` and
    /// `<dep>.status`.
    pub fn for_node(
        pipeline: &Pipeline,
        execution: &Execution,
        node: &Node,
        workspace: &Path,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.extend(pipeline.config.environment_variables.clone());
        ctx.extend(execution.environment.clone());
        ctx.extend(node.environment.clone());

        ctx.set("PIPELINE_ID", pipeline.id());
        ctx.set("PIPELINE_NAME", pipeline.name());
        ctx.set("EXECUTION_ID", execution.execution_id.to_string());
        ctx.set("NODE_ID", &node.id);
        ctx.set("NODE_NAME", &node.name);
        ctx.set("WORKSPACE", workspace.display().to_string());

        for dep in &node.dependencies {
            if let Some(record) = execution.node(dep) {
                ctx.set(format!("{}.status", dep), record.status.as_str());
                for (key, value) in &record.outputs {
                    ctx.set(format!("{}.{}", dep, key), render_value(value));
                }
            }
        }
        ctx
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn extend(&mut self, vars: HashMap<String, String>) {
        self.variables.extend(vars);
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Replace `${NAME}` placeholders; unknown names are left untouched
    pub fn substitute(&self, input: &str) -> String {
        placeholder_regex()
            .replace_all(input, |caps: &Captures| match self.variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Substitute every string inside a JSON value
    pub fn substitute_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.substitute_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn substitute_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.substitute(v)))
            .collect()
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
