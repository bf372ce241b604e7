//! Test: retries happen inside the node and are bounded by retry_count

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, Node, NodeStatus, NodeType};
use pipeline_engine::execution::ExecutionEvent;

#[tokio::test]
async fn test_retry_until_success() {
    let runner = ScriptedRunner::new().script("a", [fail("flaky"), fail("flaky"), succeed("ok")]);
    let harness = Harness::new(runner);
    let p = pipeline("retry", vec![build("a").with_retries(3)], &[]);
    let execution = harness.run(p).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let node = execution.node("a").unwrap();
    assert_eq!(node.status, NodeStatus::Completed);
    assert_eq!(node.retry_count, 2);
    assert!(node.error_message.is_none());
    assert_eq!(harness.runner.attempts("a"), 3);

    let events = harness.finish().await;
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![2, 3]);
}

#[tokio::test]
async fn test_attempts_bounded_by_retry_count() {
    let runner = ScriptedRunner::new().script("a", (0..10).map(|_| fail("always")));
    let harness = Harness::new(runner);
    let p = pipeline("exhausted", vec![build("a").with_retries(2), build("b")], &[("a", "b")]);
    let execution = harness.run(p).await;

    assert_eq!(harness.runner.attempts("a"), 3);
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let node = execution.node("a").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.retry_count, 2);
    assert!(node.error_message.as_deref().unwrap().contains("always"));
    assert!(execution.error_message.as_deref().unwrap().contains("node 'a'"));
    // later stages never ran
    assert_eq!(execution.node("b").unwrap().status, NodeStatus::Pending);

    let events = harness.finish().await;
    let failures = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeCompleted { status: NodeStatus::Failed, .. }))
        .count();
    assert_eq!(failures, 1, "exhaustion is reported once");
}

#[tokio::test]
async fn test_configuration_errors_are_not_retried() {
    let harness = Harness::new(ScriptedRunner::new());
    let broken = Node::new(NodeType::Build, "broken").with_id("broken").with_retries(3);
    let execution = harness.run(pipeline("broken", vec![broken], &[])).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let node = execution.node("broken").unwrap();
    assert_eq!(node.retry_count, 0);
    assert!(node
        .error_message
        .as_deref()
        .unwrap()
        .contains("build_command"));
    assert_eq!(harness.runner.attempts("broken"), 0);
}
