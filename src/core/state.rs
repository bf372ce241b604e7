//! Execution state models

use crate::core::pipeline::{Pipeline, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, not yet submitted to the scheduler
    Pending,
    /// Waiting for a free pipeline slot
    Queued,
    /// Stages are being processed
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Allowed moves of the execution state machine
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Status of a single node within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    /// Attempts exhausted, or awaiting a retry
    Failed,
    Cancelled,
    /// Not run because a dependency did not complete or a branch was not taken
    Skipped,
    Timeout,
}

impl NodeStatus {
    /// Terminal for the stage barrier. `Failed` is included: a node that
    /// will be retried passes through `Failed` and back to `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Outcomes that count against the stage
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Timeout)
    }

    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Skipped) | (Pending, Cancelled) => true,
            (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Timeout) => true,
            // retry
            (Failed, Running) | (Failed, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Timeout => "timeout",
        }
    }
}

/// Per-node runtime record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,

    pub node_name: String,

    pub status: NodeStatus,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Seconds between start and completion
    pub duration: Option<f64>,

    /// Captured output lines, most recent last
    #[serde(default)]
    pub logs: Vec<String>,

    #[serde(default)]
    pub outputs: HashMap<String, Value>,

    pub error_message: Option<String>,

    /// Retries consumed so far
    #[serde(default)]
    pub retry_count: u32,
}

impl NodeExecution {
    pub fn new(node_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            duration: None,
            logs: Vec::new(),
            outputs: HashMap::new(),
            error_message: None,
            retry_count: 0,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns false (and leaves the record untouched) otherwise, which is
    /// how a late worker result loses against an earlier cancellation.
    pub fn transition(&mut self, next: NodeStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == NodeStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = next;
        if next.is_terminal() {
            self.finish_at(now);
        } else {
            self.completed_at = None;
            self.duration = None;
        }
        true
    }

    fn finish_at(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration = self
            .started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
    }
}

/// Who or what started an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger: TriggerType,
    pub triggered_by: Option<String>,
}

impl TriggerInfo {
    pub fn manual(user: impl Into<String>) -> Self {
        Self {
            trigger: TriggerType::Manual,
            triggered_by: Some(user.into()),
        }
    }
}

/// One run of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,

    pub pipeline_id: String,

    pub pipeline_name: String,

    pub status: ExecutionStatus,

    pub trigger: TriggerInfo,

    /// Overrides layered on top of the pipeline's environment variables
    #[serde(default)]
    pub environment: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Topological levels computed at submission
    pub stages: Vec<Vec<String>>,

    pub current_stage: usize,

    pub node_executions: HashMap<String, NodeExecution>,

    pub error_message: Option<String>,

    pub cancelled_by: Option<String>,

    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

impl Execution {
    /// Create a pending execution with one record per node
    pub fn new(pipeline: &Pipeline, stages: Vec<Vec<String>>, trigger: TriggerInfo) -> Self {
        let node_executions = pipeline
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecution::new(&n.id, &n.name)))
            .collect();

        Self {
            execution_id: Uuid::new_v4(),
            pipeline_id: pipeline.id().to_string(),
            pipeline_name: pipeline.name().to_string(),
            status: ExecutionStatus::Pending,
            trigger,
            environment: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stages,
            current_stage: 0,
            node_executions,
            error_message: None,
            cancelled_by: None,
            outputs: HashMap::new(),
        }
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }

    /// Share of stages processed, 0..=100
    pub fn progress_percentage(&self) -> f64 {
        if self.stages.is_empty() {
            return if self.status == ExecutionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.current_stage.min(self.stages.len()) as f64 / self.stages.len() as f64) * 100.0
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeExecution> {
        self.node_executions.get_mut(node_id)
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.node_executions
            .values()
            .filter(|n| n.status == status)
            .count()
    }

    pub fn report(&self) -> ExecutionReport {
        ExecutionReport::from(self)
    }
}

/// Node entry of an [`ExecutionReport`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub outputs: HashMap<String, Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Status report returned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    pub current_stage: usize,
    pub total_stages: usize,
    pub progress_percentage: f64,
    pub node_executions: HashMap<String, NodeReport>,
    pub error_message: Option<String>,
}

impl From<&Execution> for ExecutionReport {
    fn from(execution: &Execution) -> Self {
        let node_executions = execution
            .node_executions
            .iter()
            .map(|(id, n)| {
                (
                    id.clone(),
                    NodeReport {
                        status: n.status,
                        started_at: n.started_at,
                        completed_at: n.completed_at,
                        duration: n.duration,
                        outputs: n.outputs.clone(),
                        error_message: n.error_message.clone(),
                        retry_count: n.retry_count,
                    },
                )
            })
            .collect();

        Self {
            execution_id: execution.execution_id,
            pipeline_id: execution.pipeline_id.clone(),
            status: execution.status,
            current_stage: execution.current_stage,
            total_stages: execution.total_stages(),
            progress_percentage: execution.progress_percentage(),
            node_executions,
            error_message: execution.error_message.clone(),
        }
    }
}
