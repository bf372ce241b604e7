//! Persistence port for pipelines and execution history
//!
//! The orchestrator writes through this trait at submission and when an
//! execution finishes; scheduling never reads from it.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{Execution, ExecutionStatus, NodeStatus, Pipeline, TriggerType};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,

    pub pipeline_id: String,

    pub pipeline_name: String,

    pub status: ExecutionStatus,

    pub trigger: TriggerType,

    pub triggered_by: Option<String>,

    /// Submission time
    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Stage progress, 0..=100
    pub progress: f64,

    pub completed_nodes: usize,

    pub total_nodes: usize,

    pub error_message: Option<String>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id,
            pipeline_id: execution.pipeline_id.clone(),
            pipeline_name: execution.pipeline_name.clone(),
            status: execution.status,
            trigger: execution.trigger.trigger,
            triggered_by: execution.trigger.triggered_by.clone(),
            created_at: execution.created_at,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            progress: execution.progress_percentage(),
            completed_nodes: execution.count_with_status(NodeStatus::Completed),
            total_nodes: execution.node_executions.len(),
            error_message: execution.error_message.clone(),
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Create or replace a pipeline definition
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>>;

    /// Create or replace an execution record
    async fn save_execution(&self, execution: &Execution) -> Result<()>;

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>>;

    /// Most recent executions first, optionally for one pipeline
    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    pipelines: RwLock<HashMap<String, Pipeline>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.pipelines
            .write()
            .await
            .insert(pipeline.id().to_string(), pipeline.clone());
        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(pipeline_id).cloned())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&execution_id).cloned())
    }

    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>> {
        let executions = self.executions.read().await;
        let mut summaries: Vec<ExecutionSummary> = executions
            .values()
            .filter(|e| pipeline_id.map_or(true, |id| e.pipeline_id == id))
            .map(ExecutionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Node, NodeType, TriggerInfo};

    fn pipeline(name: &str) -> Pipeline {
        let mut p = Pipeline::new(name, "");
        p.add_node(Node::new(NodeType::Source, "checkout").with_id("a"))
            .unwrap();
        p
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryPersistence::new();
        let p = pipeline("web");
        store.save_pipeline(&p).await.unwrap();
        assert_eq!(store.load_pipeline(p.id()).await.unwrap().unwrap().name(), "web");
        assert!(store.load_pipeline("missing").await.unwrap().is_none());

        let mut execution = Execution::new(&p, vec![vec!["a".into()]], TriggerInfo::manual("dev"));
        store.save_execution(&execution).await.unwrap();
        execution.transition(ExecutionStatus::Queued);
        store.save_execution(&execution).await.unwrap();

        let loaded = store
            .load_execution(execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Queued);
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let store = InMemoryPersistence::new();
        let web = pipeline("web");
        let api = pipeline("api");
        for _ in 0..3 {
            store
                .save_execution(&Execution::new(&web, vec![], TriggerInfo::default()))
                .await
                .unwrap();
        }
        store
            .save_execution(&Execution::new(&api, vec![], TriggerInfo::default()))
            .await
            .unwrap();

        assert_eq!(store.list_executions(None, 10).await.unwrap().len(), 4);
        assert_eq!(store.list_executions(Some(web.id()), 2).await.unwrap().len(), 2);
        let api_runs = store.list_executions(Some(api.id()), 10).await.unwrap();
        assert_eq!(api_runs.len(), 1);
        assert_eq!(api_runs[0].pipeline_name, "api");
        assert_eq!(api_runs[0].total_nodes, 1);
    }
}
