//! Declarative per-node-type rule tables

use crate::core::NodeType;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Expected JSON kind of a config value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bool,
    Integer,
    /// Integer or float
    Number,
    List,
    Map,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::List => value.is_array(),
            FieldType::Map => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Bool => "boolean",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::List => "list",
            FieldType::Map => "mapping",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: &'static str,
    pub required: bool,
    pub field_type: FieldType,
    pub pattern: Option<Regex>,
    pub range: Option<(f64, f64)>,
}

impl FieldRule {
    fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            required: true,
            field_type,
            pattern: None,
            range: None,
        }
    }

    fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(pattern).expect("valid regex"));
        self
    }

    fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }
}

/// Bounds on incoming (dependencies) and outgoing edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cardinality {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
}

impl Cardinality {
    const fn new(inputs: (usize, usize), outputs: (usize, usize)) -> Self {
        Self {
            min_inputs: inputs.0,
            max_inputs: inputs.1,
            min_outputs: outputs.0,
            max_outputs: outputs.1,
        }
    }

    const UNBOUNDED: Cardinality = Cardinality::new((0, usize::MAX), (0, usize::MAX));
}

#[derive(Debug, Clone)]
pub struct NodeRules {
    pub node_type: NodeType,
    pub description: &'static str,
    pub fields: Vec<FieldRule>,
    pub cardinality: Cardinality,
}

impl NodeRules {
    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldRule> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// Keys that pick how a step runs; shared by the command-driven node types
fn execution_fields() -> Vec<FieldRule> {
    vec![
        FieldRule::optional("image", FieldType::String),
        FieldRule::optional("volumes", FieldType::List),
        FieldRule::optional("working_directory", FieldType::String),
    ]
}

fn build_rules() -> HashMap<NodeType, NodeRules> {
    use FieldType::*;
    let mut rules = HashMap::new();

    rules.insert(
        NodeType::Source,
        NodeRules {
            node_type: NodeType::Source,
            description: "Check out a repository branch into the workspace",
            fields: vec![
                FieldRule::required("repository", String)
                    .pattern(r"^[a-zA-Z0-9._-]+(/[a-zA-Z0-9._-]+)*$"),
                FieldRule::required("branch", String).pattern(r"^[a-zA-Z0-9._/-]+$"),
                FieldRule::optional("checkout_path", String),
                FieldRule::optional("submodules", Bool),
                FieldRule::optional("depth", Integer).range(1.0, 1_000_000.0),
                FieldRule::optional("token", String),
                FieldRule::optional("clone_url", String).pattern(r"^(https?|ssh|git|file)://|^git@"),
            ],
            cardinality: Cardinality::new((0, 0), (1, 1)),
        },
    );

    let mut build_fields = vec![
        FieldRule::required("build_command", String).pattern(r".+"),
        FieldRule::optional("build_path", String).pattern(r"^[a-zA-Z0-9._/-]+$"),
        FieldRule::optional("artifacts", List),
        FieldRule::optional("cache_key", String),
        FieldRule::optional("environment", Map),
    ];
    build_fields.extend(execution_fields());
    rules.insert(
        NodeType::Build,
        NodeRules {
            node_type: NodeType::Build,
            description: "Compile or package the project",
            fields: build_fields,
            cardinality: Cardinality::new((1, 5), (0, 3)),
        },
    );

    let mut test_fields = vec![
        FieldRule::required("test_command", String),
        FieldRule::optional("test_path", String).pattern(r"^[a-zA-Z0-9._/-]*$"),
        FieldRule::optional("coverage_threshold", Number).range(0.0, 100.0),
        FieldRule::optional("coverage_pattern", String),
        FieldRule::optional("test_results_format", String).pattern(r"^(junit|tap|json)$"),
        FieldRule::optional("parallel", Bool),
        FieldRule::optional("artifacts", List),
    ];
    test_fields.extend(execution_fields());
    rules.insert(
        NodeType::Test,
        NodeRules {
            node_type: NodeType::Test,
            description: "Run the test suite and enforce coverage",
            fields: test_fields,
            cardinality: Cardinality::new((1, 3), (0, 2)),
        },
    );

    let mut deploy_fields = vec![
        FieldRule::required("target_environment", String)
            .pattern(r"^(dev|staging|prod|production)$"),
        FieldRule::required("deploy_command", String),
        FieldRule::optional("health_check_url", String).pattern(r"^https?://[a-zA-Z0-9.-]+"),
        FieldRule::optional("rollback_enabled", Bool),
        FieldRule::optional("timeout", Integer).range(30.0, 3600.0),
        FieldRule::optional("strategy", String).pattern(r"^(rolling|blue-green|canary)$"),
    ];
    deploy_fields.extend(execution_fields());
    rules.insert(
        NodeType::Deploy,
        NodeRules {
            node_type: NodeType::Deploy,
            description: "Ship artifacts to a target environment",
            fields: deploy_fields,
            cardinality: Cardinality::new((1, 2), (0, 1)),
        },
    );

    rules.insert(
        NodeType::Notification,
        NodeRules {
            node_type: NodeType::Notification,
            description: "Tell people or systems about the run",
            fields: vec![
                FieldRule::required("notification_type", String)
                    .pattern(r"^(email|slack|webhook|teams)$"),
                FieldRule::required("recipients", List),
                FieldRule::optional("message_template", String),
                FieldRule::optional("conditions", List),
                FieldRule::optional("webhook_url", String).pattern(r"^https?://"),
            ],
            cardinality: Cardinality::new((0, 10), (0, 0)),
        },
    );

    rules.insert(
        NodeType::Condition,
        NodeRules {
            node_type: NodeType::Condition,
            description: "Evaluate an expression and pick a branch",
            fields: vec![
                FieldRule::required("condition_expression", String),
                FieldRule::optional("true_branch", String),
                FieldRule::optional("false_branch", String),
                FieldRule::optional("timeout", Integer),
            ],
            cardinality: Cardinality::new((0, 5), (0, 5)),
        },
    );

    for (node_type, description) in [
        (NodeType::Parallel, "Group nodes that run side by side"),
        (NodeType::Sequential, "Group nodes that run in order"),
    ] {
        rules.insert(
            node_type,
            NodeRules {
                node_type,
                description,
                fields: vec![FieldRule::optional("description", String)],
                cardinality: Cardinality::UNBOUNDED,
            },
        );
    }

    rules
}

fn rule_table() -> &'static HashMap<NodeType, NodeRules> {
    static RULES: OnceLock<HashMap<NodeType, NodeRules>> = OnceLock::new();
    RULES.get_or_init(build_rules)
}

/// Rule set for a node type
pub fn rules_for(node_type: NodeType) -> &'static NodeRules {
    // every variant is inserted by build_rules
    &rule_table()[&node_type]
}

/// Catalogue entry describing a node type to editors
#[derive(Debug, Clone, Serialize)]
pub struct NodeDefinition {
    pub node_type: NodeType,
    pub description: &'static str,
    pub required_fields: Vec<&'static str>,
    pub optional_fields: Vec<&'static str>,
    pub cardinality: Cardinality,
}

/// Definitions for every node type, in declaration order
pub fn node_definitions() -> Vec<NodeDefinition> {
    NodeType::ALL
        .iter()
        .map(|t| {
            let rules = rules_for(*t);
            NodeDefinition {
                node_type: *t,
                description: rules.description,
                required_fields: rules.required_fields().map(|f| f.name).collect(),
                optional_fields: rules
                    .fields
                    .iter()
                    .filter(|f| !f.required)
                    .map(|f| f.name)
                    .collect(),
                cardinality: rules.cardinality,
            }
        })
        .collect()
}
