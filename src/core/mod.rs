//! Core domain models for the pipeline engine
//!
//! This module defines the graph model (nodes, connections, pipelines),
//! the runtime state of executions, and the small languages evaluated
//! against a running execution (placeholders and condition expressions).

pub mod condition;
pub mod context;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod state;

pub use condition::Condition;
pub use context::ExecutionContext;
pub use error::{PipelineError, Result};
pub use node::*;
pub use pipeline::*;
pub use state::*;
