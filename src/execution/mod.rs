//! Pipeline execution: the orchestrator, node dispatch and step runners

pub mod cancel;
mod dispatch;
pub mod events;
pub mod executor;
pub mod orchestrator;
mod process;
pub mod scheduler;
pub mod step;

pub use cancel::CancelSignal;
pub use dispatch::NodeOutcome;
pub use events::{EventBus, ExecutionEvent, ExecutionObserver, FnObserver};
pub use executor::StepExecutor;
pub use orchestrator::{Orchestrator, SHUTDOWN_CANCELLER};
pub use scheduler::ExecutionScheduler;
pub use step::{
    ScriptLanguage, StepDescriptor, StepKind, StepMetrics, StepResult, StepRunner, StepStatus,
};
