//! Pipeline validation
//!
//! Rules are data: each node type has a table of config fields with their
//! expected kinds, formats and ranges, plus bounds on how many edges it
//! may have. The validator walks those tables and a handful of semantic
//! checks, collecting findings into reports instead of failing.

pub mod rules;
pub mod validator;

pub use rules::{node_definitions, rules_for, Cardinality, FieldRule, FieldType, NodeDefinition, NodeRules};
pub use validator::{
    NodeValidationReport, PipelineValidationReport, ValidationLevel, ValidationResult,
    ValidationSummary, Validator,
};
