//! Node and pipeline validation

use crate::core::{Condition, Node, NodeType, Pipeline};
use crate::validation::rules::{rules_for, NodeRules};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Longest timeout that does not draw a warning
pub const MAX_RECOMMENDED_TIMEOUT_SECS: i64 = 7200;

const PACKAGE_MANAGERS: [&str; 9] = [
    "npm", "yarn", "pnpm", "pip", "mvn", "gradle", "make", "cargo", "go ",
];

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Error,
    Warning,
    Info,
}

/// One finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub level: ValidationLevel,
    pub message: String,
    pub field: Option<String>,
    pub suggestion: Option<String>,
}

impl ValidationResult {
    fn new(level: ValidationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            field: None,
            suggestion: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::new(ValidationLevel::Error, message)
    }

    fn warning(message: impl Into<String>) -> Self {
        Self::new(ValidationLevel::Warning, message)
    }

    fn info(message: impl Into<String>) -> Self {
        Self::new(ValidationLevel::Info, message)
    }

    fn field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Counts by level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

impl ValidationSummary {
    fn from_results<'a>(results: impl IntoIterator<Item = &'a ValidationResult>) -> Self {
        let mut summary = Self::default();
        for r in results {
            match r.level {
                ValidationLevel::Error => summary.errors += 1,
                ValidationLevel::Warning => summary.warnings += 1,
                ValidationLevel::Info => summary.infos += 1,
            }
        }
        summary
    }

    fn add(&mut self, other: ValidationSummary) {
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.infos += other.infos;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeValidationReport {
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub is_valid: bool,
    pub results: Vec<ValidationResult>,
    pub summary: ValidationSummary,
}

impl NodeValidationReport {
    pub fn with_level(&self, level: ValidationLevel) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(move |r| r.level == level)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineValidationReport {
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub is_valid: bool,
    /// Findings about the graph as a whole
    pub results: Vec<ValidationResult>,
    pub nodes: Vec<NodeValidationReport>,
    /// Totals across pipeline and node findings
    pub summary: ValidationSummary,
}

impl PipelineValidationReport {
    /// Every error message, pipeline-level first, prefixed with the node name
    pub fn error_messages(&self) -> Vec<String> {
        let pipeline = self
            .results
            .iter()
            .filter(|r| r.level == ValidationLevel::Error)
            .map(|r| r.message.clone());
        let nodes = self.nodes.iter().flat_map(|n| {
            n.with_level(ValidationLevel::Error)
                .map(move |r| format!("{}: {}", n.node_name, r.message))
        });
        pipeline.chain(nodes).collect()
    }
}

/// Stateless validator over the rule tables
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate one node; cardinality is only checked when the owning
    /// pipeline is supplied
    pub fn validate_node(&self, node: &Node, pipeline: Option<&Pipeline>) -> NodeValidationReport {
        let rules = rules_for(node.node_type);
        let mut results = Vec::new();

        self.check_required(node, rules, &mut results);
        self.check_fields(node, rules, &mut results);
        if let Some(pipeline) = pipeline {
            self.check_cardinality(node, rules, pipeline, &mut results);
        }
        self.check_semantics(node, &mut results);
        self.check_timeout(node, &mut results);
        self.check_unknown_keys(node, rules, &mut results);

        let summary = ValidationSummary::from_results(&results);
        NodeValidationReport {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type,
            is_valid: summary.errors == 0,
            results,
            summary,
        }
    }

    /// Validate every node plus the graph structure
    pub fn validate_pipeline(&self, pipeline: &Pipeline) -> PipelineValidationReport {
        let mut results = Vec::new();

        if pipeline.name().trim().is_empty() {
            results.push(
                ValidationResult::error("Pipeline name is required")
                    .field("name")
                    .suggest("Give the pipeline a descriptive name"),
            );
        }
        if pipeline.nodes.is_empty() {
            results.push(
                ValidationResult::error("Pipeline must contain at least one node")
                    .field("nodes")
                    .suggest("Add a source node to get started"),
            );
        }
        for id in pipeline.duplicate_node_ids() {
            results.push(ValidationResult::error(format!("Duplicate node id '{}'", id)).field("nodes"));
        }
        for conn in pipeline.dangling_connections() {
            results.push(
                ValidationResult::error(format!(
                    "Connection {} -> {} references a missing node",
                    conn.from, conn.to
                ))
                .field("connections"),
            );
        }
        if pipeline.has_cycle() {
            let detail = match pipeline.compute_stages() {
                Err(err) => err.to_string(),
                Ok(_) => "cycle detected".to_string(),
            };
            results.push(
                ValidationResult::error(format!("Pipeline contains a dependency cycle ({})", detail))
                    .field("connections")
                    .suggest("Remove one of the connections that closes the loop"),
            );
        }
        if !pipeline.nodes.is_empty() {
            if pipeline.source_nodes().is_empty() {
                results.push(
                    ValidationResult::warning("Pipeline should have at least one source node")
                        .suggest("Add a source node that checks out the repository"),
                );
            }
            let disconnected = pipeline.find_disconnected_nodes();
            if !disconnected.is_empty() {
                let names: Vec<&str> = disconnected
                    .iter()
                    .filter_map(|id| pipeline.node(id).map(|n| n.name.as_str()))
                    .collect();
                results.push(
                    ValidationResult::warning(format!("Disconnected nodes: {}", names.join(", ")))
                        .suggest("Connect these nodes or remove them"),
                );
            }
        }

        let nodes: Vec<NodeValidationReport> = pipeline
            .nodes
            .iter()
            .map(|n| self.validate_node(n, Some(pipeline)))
            .collect();

        let mut summary = ValidationSummary::from_results(&results);
        for report in &nodes {
            summary.add(report.summary);
        }

        PipelineValidationReport {
            pipeline_id: pipeline.id().to_string(),
            pipeline_name: pipeline.name().to_string(),
            is_valid: summary.errors == 0,
            results,
            nodes,
            summary,
        }
    }

    fn check_required(&self, node: &Node, rules: &NodeRules, results: &mut Vec<ValidationResult>) {
        for rule in rules.required_fields() {
            let present = node.config.get(rule.name).is_some_and(|v| !is_empty(v));
            if !present {
                results.push(
                    ValidationResult::error(format!("Required field '{}' is missing", rule.name))
                        .field(rule.name)
                        .suggest(format!("Add {} configuration", rule.name)),
                );
            }
        }
    }

    /// Type, then pattern, then range passes; a mistyped field skips the later passes
    fn check_fields(&self, node: &Node, rules: &NodeRules, results: &mut Vec<ValidationResult>) {
        let mut typed = Vec::new();
        for rule in &rules.fields {
            let Some(value) = node.config.get(rule.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if rule.field_type.matches(value) {
                typed.push((rule, value));
            } else {
                results.push(
                    ValidationResult::error(format!(
                        "Field '{}' must be a {}",
                        rule.name,
                        rule.field_type.name()
                    ))
                    .field(rule.name),
                );
            }
        }

        for (rule, value) in &typed {
            if let (Some(pattern), Some(text)) = (&rule.pattern, value.as_str()) {
                if !pattern.is_match(text) {
                    results.push(
                        ValidationResult::error(format!(
                            "Field '{}' does not match the required format",
                            rule.name
                        ))
                        .field(rule.name)
                        .suggest(format!("Expected pattern: {}", pattern.as_str())),
                    );
                }
            }
        }

        for (rule, value) in &typed {
            if let (Some((min, max)), Some(number)) = (rule.range, value.as_f64()) {
                if number < min || number > max {
                    results.push(
                        ValidationResult::error(format!(
                            "Field '{}' must be between {} and {}",
                            rule.name, min, max
                        ))
                        .field(rule.name),
                    );
                }
            }
        }
    }

    fn check_cardinality(
        &self,
        node: &Node,
        rules: &NodeRules,
        pipeline: &Pipeline,
        results: &mut Vec<ValidationResult>,
    ) {
        let bounds = rules.cardinality;
        let inputs = node.dependencies.len();
        let outputs = pipeline.out_degree(&node.id);

        if inputs < bounds.min_inputs {
            results.push(
                ValidationResult::error(format!(
                    "{} node requires at least {} input connection(s), has {}",
                    node.node_type, bounds.min_inputs, inputs
                ))
                .field("dependencies"),
            );
        } else if inputs > bounds.max_inputs {
            results.push(
                ValidationResult::warning(format!(
                    "{} node accepts at most {} input connection(s), has {}",
                    node.node_type, bounds.max_inputs, inputs
                ))
                .field("dependencies"),
            );
        }

        if outputs < bounds.min_outputs {
            results.push(ValidationResult::warning(format!(
                "{} node should have at least {} output connection(s), has {}",
                node.node_type, bounds.min_outputs, outputs
            )));
        } else if outputs > bounds.max_outputs {
            results.push(ValidationResult::info(format!(
                "{} node usually has at most {} output connection(s), has {}",
                node.node_type, bounds.max_outputs, outputs
            )));
        }
    }

    fn check_semantics(&self, node: &Node, results: &mut Vec<ValidationResult>) {
        match node.node_type {
            NodeType::Source => {
                if let Some(repo) = node.config_str("repository") {
                    if !repo.contains('/') {
                        results.push(
                            ValidationResult::warning("Repository should include owner/name format")
                                .field("repository")
                                .suggest("Use format: owner/repository-name"),
                        );
                    }
                }
                if let Some(branch) = node.config_str("branch") {
                    if branch == "main" || branch == "master" {
                        results.push(
                            ValidationResult::info(format!("Using production branch '{}'", branch))
                                .field("branch"),
                        );
                    }
                }
            }
            NodeType::Build => {
                if let Some(command) = node.config_str("build_command") {
                    if !PACKAGE_MANAGERS.iter().any(|pm| command.contains(pm)) {
                        results.push(
                            ValidationResult::warning(
                                "Build command doesn't use a recognized package manager",
                            )
                            .field("build_command")
                            .suggest("Consider using npm, yarn, pip, maven, cargo, etc."),
                        );
                    }
                }
                if node.config_list("artifacts").len() > 10 {
                    results.push(
                        ValidationResult::warning("Large number of artifacts may impact performance")
                            .field("artifacts"),
                    );
                }
            }
            NodeType::Test => {
                if let Some(threshold) = node.config_f64("coverage_threshold") {
                    if threshold > 95.0 {
                        results.push(
                            ValidationResult::info(
                                "Very high coverage threshold may slow down development",
                            )
                            .field("coverage_threshold"),
                        );
                    } else if threshold < 50.0 {
                        results.push(
                            ValidationResult::warning("Low coverage threshold may miss bugs")
                                .field("coverage_threshold"),
                        );
                    }
                }
            }
            NodeType::Deploy => {
                let production = matches!(
                    node.config_str("target_environment"),
                    Some("prod") | Some("production")
                );
                if production {
                    if !node.config.contains_key("health_check_url") {
                        results.push(
                            ValidationResult::warning(
                                "Production deployment should include health checks",
                            )
                            .field("health_check_url")
                            .suggest("Add health_check_url configuration"),
                        );
                    }
                    if node.config_bool("rollback_enabled") != Some(true) {
                        results.push(
                            ValidationResult::warning("Production deployment should enable rollback")
                                .field("rollback_enabled")
                                .suggest("Set rollback_enabled to true"),
                        );
                    }
                }
            }
            NodeType::Notification => {
                for recipient in node.config_list("recipients") {
                    if recipient.contains('@') && !email_regex().is_match(&recipient) {
                        results.push(
                            ValidationResult::warning(format!("Invalid email format: {}", recipient))
                                .field("recipients"),
                        );
                    }
                }
            }
            NodeType::Condition => {
                if let Some(expr) = node.config_str("condition_expression") {
                    if let Err(err) = Condition::parse(expr) {
                        results.push(
                            ValidationResult::error(format!("Invalid condition expression: {}", err))
                                .field("condition_expression")
                                .suggest("Use comparisons joined with and/or/not, e.g. BRANCH == 'main'"),
                        );
                    }
                }
            }
            NodeType::Parallel | NodeType::Sequential => {}
        }
    }

    fn check_timeout(&self, node: &Node, results: &mut Vec<ValidationResult>) {
        if node.timeout <= 0 {
            results.push(ValidationResult::error("Timeout must be greater than 0").field("timeout"));
        } else if node.timeout > MAX_RECOMMENDED_TIMEOUT_SECS {
            results.push(
                ValidationResult::warning("Timeout is longer than 2 hours")
                    .field("timeout")
                    .suggest("Consider splitting long-running work into smaller nodes"),
            );
        }
    }

    fn check_unknown_keys(&self, node: &Node, rules: &NodeRules, results: &mut Vec<ValidationResult>) {
        let known: HashSet<&str> = rules.fields.iter().map(|f| f.name).collect();
        let mut unknown: Vec<&String> = node
            .config
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .collect();
        unknown.sort();
        for key in unknown {
            results.push(
                ValidationResult::info(format!("Unknown configuration field '{}'", key)).field(key),
            );
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn levels(report: &NodeValidationReport) -> Vec<ValidationLevel> {
        report.results.iter().map(|r| r.level).collect()
    }

    #[test]
    fn test_missing_required_fields() {
        let node = Node::new(NodeType::Deploy, "ship");
        let report = Validator::new().validate_node(&node, None);
        assert!(!report.is_valid);
        let fields: Vec<_> = report
            .with_level(ValidationLevel::Error)
            .filter_map(|r| r.field.as_deref())
            .collect();
        assert_eq!(fields, vec!["target_environment", "deploy_command"]);
    }

    #[test]
    fn test_type_pattern_and_range() {
        let node = Node::new(NodeType::Test, "unit")
            .with_config("test_command", "pytest")
            .with_config("parallel", "yes")
            .with_config("test_results_format", "xml")
            .with_config("coverage_threshold", 150);
        let report = Validator::new().validate_node(&node, None);
        let errors: Vec<_> = report
            .with_level(ValidationLevel::Error)
            .map(|r| r.field.clone().unwrap_or_default())
            .collect();
        // type errors first, then pattern, then range
        assert_eq!(errors, vec!["parallel", "test_results_format", "coverage_threshold"]);
    }

    #[test]
    fn test_production_deploy_without_health_check() {
        let node = Node::new(NodeType::Deploy, "prod")
            .with_config("target_environment", "production")
            .with_config("deploy_command", "./deploy.sh")
            .with_config("rollback_enabled", true);
        let report = Validator::new().validate_node(&node, None);
        assert!(report.is_valid);
        let warnings: Vec<_> = report.with_level(ValidationLevel::Warning).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field.as_deref(), Some("health_check_url"));
        assert!(warnings[0]
            .suggestion
            .as_deref()
            .is_some_and(|s| s.contains("health_check_url")));
    }

    #[test]
    fn test_production_deploy_without_rollback_adds_warning() {
        let node = Node::new(NodeType::Deploy, "prod")
            .with_config("target_environment", "prod")
            .with_config("deploy_command", "./deploy.sh")
            .with_config("health_check_url", "https://example.com/health");
        let report = Validator::new().validate_node(&node, None);
        assert_eq!(levels(&report), vec![ValidationLevel::Warning]);
        assert_eq!(report.results[0].field.as_deref(), Some("rollback_enabled"));
    }

    #[test]
    fn test_coverage_threshold_levels() {
        let high = Node::new(NodeType::Test, "t")
            .with_config("test_command", "pytest")
            .with_config("coverage_threshold", 98);
        let low = Node::new(NodeType::Test, "t")
            .with_config("test_command", "pytest")
            .with_config("coverage_threshold", 40.5);
        let v = Validator::new();
        assert_eq!(levels(&v.validate_node(&high, None)), vec![ValidationLevel::Info]);
        assert_eq!(levels(&v.validate_node(&low, None)), vec![ValidationLevel::Warning]);
    }

    #[test]
    fn test_timeout_bounds() {
        let v = Validator::new();
        let build = |t| {
            Node::new(NodeType::Build, "b")
                .with_config("build_command", "make")
                .with_timeout(t)
        };
        assert!(!v.validate_node(&build(0), None).is_valid);
        let long = v.validate_node(&build(7201), None);
        assert!(long.is_valid);
        assert_eq!(levels(&long), vec![ValidationLevel::Warning]);
        assert!(v.validate_node(&build(7200), None).results.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_info() {
        let node = Node::new(NodeType::Build, "b")
            .with_config("build_command", "npm run build")
            .with_config("zeta", 1)
            .with_config("alpha", true);
        let report = Validator::new().validate_node(&node, None);
        assert!(report.is_valid);
        let fields: Vec<_> = report.results.iter().filter_map(|r| r.field.as_deref()).collect();
        assert_eq!(fields, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_condition_expression_must_parse() {
        let node = Node::new(NodeType::Condition, "gate")
            .with_config("condition_expression", "os.system('rm -rf /')");
        let report = Validator::new().validate_node(&node, None);
        assert!(!report.is_valid);
    }

    #[test]
    fn test_notification_email_format() {
        let node = Node::new(NodeType::Notification, "mail")
            .with_config("notification_type", "email")
            .with_config("recipients", json!(["dev@example.com", "broken@", "#channel"]));
        let report = Validator::new().validate_node(&node, None);
        assert_eq!(report.summary.warnings, 1);
    }

    fn valid_pipeline() -> Pipeline {
        let mut p = Pipeline::new("web", "");
        p.add_node(
            Node::new(NodeType::Source, "checkout")
                .with_id("src")
                .with_config("repository", "acme/web")
                .with_config("branch", "develop"),
        )
        .unwrap();
        p.add_node(
            Node::new(NodeType::Build, "build")
                .with_id("build")
                .with_config("build_command", "npm run build"),
        )
        .unwrap();
        p.connect("src", "build").unwrap();
        p
    }

    #[test]
    fn test_valid_pipeline() {
        let report = Validator::new().validate_pipeline(&valid_pipeline());
        assert!(report.is_valid, "{:?}", report.error_messages());
        assert_eq!(report.summary.errors, 0);
    }

    #[test]
    fn test_cardinality_errors_and_warnings() {
        let mut p = valid_pipeline();
        p.add_node(
            Node::new(NodeType::Build, "orphan build")
                .with_id("orphan")
                .with_config("build_command", "make"),
        )
        .unwrap();
        let report = Validator::new().validate_pipeline(&p);
        assert!(!report.is_valid);
        let orphan = report.nodes.iter().find(|n| n.node_id == "orphan").unwrap();
        assert!(!orphan.is_valid);
        assert!(report
            .results
            .iter()
            .any(|r| r.level == ValidationLevel::Warning && r.message.contains("orphan build")));
    }

    #[test]
    fn test_pipeline_structural_errors() {
        let mut p = valid_pipeline();
        p.config.name = " ".into();
        p.connect("build", "src").unwrap();
        let report = Validator::new().validate_pipeline(&p);
        assert!(!report.is_valid);
        let messages = report.error_messages();
        assert!(messages.iter().any(|m| m.contains("name")));
        assert!(messages.iter().any(|m| m.contains("cycle")));

        let empty = Pipeline::new("empty", "");
        let report = Validator::new().validate_pipeline(&empty);
        assert_eq!(report.summary.errors, 1);
    }
}
