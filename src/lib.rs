//! pipeline-engine - validates, schedules and runs CI/CD pipeline graphs

pub mod cli;
pub mod config;
pub mod core;
pub mod execution;
pub mod logging;
pub mod persistence;
pub mod validation;

// Re-export commonly used types
pub use config::{EngineConfig, ExecutorConfig, LogConfig, SchedulerConfig};
pub use core::{
    Condition, Execution, ExecutionContext, ExecutionReport, ExecutionStatus, Node, NodeStatus,
    NodeType, Pipeline, PipelineError, TriggerInfo, TriggerType,
};
pub use execution::{
    CancelSignal, ExecutionEvent, ExecutionObserver, FnObserver, Orchestrator, StepExecutor,
    StepRunner,
};
pub use logging::{LogEntry, LogFilter, LogLevel, LogSink, LogStreamer};
pub use persistence::{ExecutionSummary, InMemoryPersistence, PersistenceBackend};
pub use validation::{PipelineValidationReport, ValidationLevel, Validator};
