//! Test: write-through persistence, status queries and reaping

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, TriggerInfo, TriggerType};
use pipeline_engine::logging::NullSink;
use pipeline_engine::persistence::{InMemoryPersistence, PersistenceBackend};
use pipeline_engine::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_executions_are_written_through() {
    let workspace = tempfile::TempDir::new().unwrap();
    let store = Arc::new(InMemoryPersistence::new());
    let orchestrator = Orchestrator::new(
        fast_config(&workspace),
        fast_executor(),
        Arc::new(ScriptedRunner::new()),
        Arc::new(NullSink),
    )
    .with_store(store.clone());
    orchestrator.start();

    let p = linear();
    let pipeline_id = p.id().to_string();
    let id = orchestrator
        .submit(p, TriggerInfo::manual("carol"), HashMap::new())
        .await
        .unwrap();
    orchestrator.wait(id).await.unwrap();
    orchestrator.shutdown().await;

    let saved = store.load_execution(id).await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Completed);
    assert_eq!(saved.stages.len(), 3);
    assert!(store.load_pipeline(&pipeline_id).await.unwrap().is_some());

    let history = store.list_executions(Some(&pipeline_id), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger, TriggerType::Manual);
    assert_eq!(history[0].triggered_by.as_deref(), Some("carol"));
    assert_eq!(history[0].completed_nodes, 3);
}

#[tokio::test]
async fn test_status_report_and_listing() {
    let harness = Harness::new(ScriptedRunner::new());
    let older = harness.run(linear()).await.execution_id;
    let newer = harness.run(diamond()).await.execution_id;

    let report = harness.orchestrator.status(newer).unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.total_stages, 3);
    assert_eq!(report.progress_percentage, 100.0);
    assert_eq!(report.node_executions.len(), 4);

    let listed = harness.orchestrator.list_executions();
    let ids: Vec<_> = listed.iter().map(|s| s.execution_id).collect();
    assert_eq!(ids, vec![newer, older]);
    assert!(harness.orchestrator.status(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn test_reaper_drops_expired_executions() {
    let harness = Harness::with_config(ScriptedRunner::new(), |c| {
        c.retention_secs = 0;
        c.cleanup_workspaces = true;
    });
    let id = harness.run(linear()).await.execution_id;
    let dir = harness.workspace.path().join(id.to_string());
    assert!(dir.exists());

    assert_eq!(harness.orchestrator.reap_expired().await, 1);
    assert!(harness.orchestrator.status(id).is_none());
    assert!(harness.orchestrator.wait(id).await.is_none());
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_reaper_keeps_recent_executions() {
    let harness = Harness::new(ScriptedRunner::new());
    let id = harness.run(linear()).await.execution_id;

    assert_eq!(harness.orchestrator.reap_expired().await, 0);
    assert!(harness.orchestrator.status(id).is_some());
}
