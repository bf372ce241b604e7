//! Test: cancelling queued and running executions

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, NodeStatus, TriggerInfo};
use pipeline_engine::execution::{ExecutionEvent, SHUTDOWN_CANCELLER};
use std::collections::HashMap;
use std::time::Duration;

fn slow(id: &str) -> ScriptedRunner {
    ScriptedRunner::new().script(id, [Behavior::Sleep(Duration::from_secs(30))])
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let harness = Harness::new(slow("b"));
    let id = harness.submit(linear()).await;
    harness.wait_for_running(id, "b").await;

    assert!(harness.orchestrator.cancel(id, "alice").await);
    let execution = harness.wait(id).await;

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.cancelled_by.as_deref(), Some("alice"));
    assert!(execution.error_message.as_deref().unwrap().contains("alice"));
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.node("a").unwrap().status, NodeStatus::Completed);
    assert_eq!(execution.node("b").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(execution.node("c").unwrap().status, NodeStatus::Pending);

    // terminal executions cannot be cancelled again
    assert!(!harness.orchestrator.cancel(id, "bob").await);
    assert_eq!(
        harness.orchestrator.execution(id).unwrap().cancelled_by.as_deref(),
        Some("alice")
    );

    let events = harness.finish().await;
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::ExecutionCancelled { cancelled_by: Some(by), .. } if by == "alice"
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::StageStarted { stage: 2, .. })));
}

#[tokio::test]
async fn test_cancel_unknown_execution() {
    let harness = Harness::new(ScriptedRunner::new());
    assert!(!harness.orchestrator.cancel(uuid::Uuid::new_v4(), "alice").await);
}

#[tokio::test]
async fn test_cancel_queued_execution() {
    let harness = Harness::with_config(slow("hold"), |c| c.max_concurrent_pipelines = 1);
    let first = harness
        .submit(pipeline("first", vec![build("hold")], &[]))
        .await;
    harness.wait_for_running(first, "hold").await;

    let second = harness
        .submit(pipeline("second", vec![build("never")], &[]))
        .await;
    assert_eq!(
        harness.orchestrator.execution(second).unwrap().status,
        ExecutionStatus::Queued
    );

    assert!(harness.orchestrator.cancel(second, "alice").await);
    let execution = harness.wait(second).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(execution.started_at.is_none());
    assert_eq!(execution.node("never").unwrap().status, NodeStatus::Pending);
    assert_eq!(harness.orchestrator.queued_count(), 0);

    assert!(harness.orchestrator.cancel(first, "alice").await);
    harness.wait(first).await;
    assert_eq!(harness.runner.attempts("never"), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_retry_backoff() {
    let runner = ScriptedRunner::new().script("a", [fail("flaky")]);
    let harness = Harness::with_config(runner, |c| {
        c.retry_backoff_base_ms = 30_000;
        c.retry_backoff_cap_secs = 60;
    });
    let id = harness
        .submit(pipeline("backoff", vec![build("a").with_retries(3)], &[]))
        .await;

    // wait for the first attempt to fail
    for _ in 0..200 {
        let retried = harness
            .orchestrator
            .execution(id)
            .and_then(|e| e.node("a").map(|n| n.retry_count))
            == Some(1);
        if retried {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(harness.orchestrator.cancel(id, "alice").await);
    let execution = harness.wait(id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    // the node task settles the record once it leaves the backoff
    let mut status = None;
    for _ in 0..200 {
        status = harness
            .orchestrator
            .execution(id)
            .and_then(|e| e.node("a").map(|n| n.status));
        if status == Some(NodeStatus::Cancelled) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(NodeStatus::Cancelled));
    assert_eq!(harness.runner.attempts("a"), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_active_executions() {
    let harness = Harness::new(slow("a"));
    let id = harness.submit(linear()).await;
    harness.wait_for_running(id, "a").await;

    tokio::time::timeout(Duration::from_secs(10), harness.orchestrator.shutdown())
        .await
        .expect("shutdown finished");

    let execution = harness.orchestrator.execution(id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.cancelled_by.as_deref(), Some(SHUTDOWN_CANCELLER));
    assert_eq!(execution.node("a").unwrap().status, NodeStatus::Cancelled);

    let refused = harness
        .orchestrator
        .submit(linear(), TriggerInfo::manual("tester"), HashMap::new())
        .await;
    assert!(refused.is_err());
}
