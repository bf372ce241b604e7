//! Test: failed nodes, continue_on_error and skip propagation

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, NodeStatus};
use pipeline_engine::execution::ExecutionEvent;

#[tokio::test]
async fn test_failure_stops_later_stages() {
    let runner = ScriptedRunner::new().script("b", [fail("exit code 2")]);
    let harness = Harness::new(runner);
    let execution = harness.run(linear()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.node("a").unwrap().status, NodeStatus::Completed);
    assert_eq!(execution.node("b").unwrap().status, NodeStatus::Failed);
    // never reached, so never touched
    assert_eq!(execution.node("c").unwrap().status, NodeStatus::Pending);
    assert_eq!(harness.runner.order(), vec!["a", "b"]);

    let message = execution.error_message.as_deref().unwrap();
    assert!(message.contains("node 'b'"));
    assert!(message.contains("exit code 2"));

    let events = harness.finish().await;
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::ExecutionFailed { .. })
    ));
}

#[tokio::test]
async fn test_failure_in_stage_lets_siblings_finish() {
    let runner = ScriptedRunner::new().script("b", [fail("broken")]);
    let harness = Harness::new(runner);
    let execution = harness.run(diamond()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.node("b").unwrap().status, NodeStatus::Failed);
    assert_eq!(execution.node("c").unwrap().status, NodeStatus::Completed);
    assert_eq!(execution.node("d").unwrap().status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_continue_on_error_skips_dependents() {
    let runner = ScriptedRunner::new().script("lint", [fail("style violations")]);
    let harness = Harness::new(runner);
    let p = pipeline(
        "tolerant",
        vec![
            build("lint").with_continue_on_error(true),
            build("compile"),
            build("report"),
            build("publish"),
            build("archive"),
        ],
        &[
            ("lint", "report"),
            ("report", "archive"),
            ("compile", "publish"),
        ],
    );
    let execution = harness.run(p).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.node("lint").unwrap().status, NodeStatus::Failed);
    assert_eq!(execution.node("compile").unwrap().status, NodeStatus::Completed);
    assert_eq!(execution.node("publish").unwrap().status, NodeStatus::Completed);

    // skips propagate down the chain
    let report = execution.node("report").unwrap();
    assert_eq!(report.status, NodeStatus::Skipped);
    assert!(report.error_message.as_deref().unwrap().contains("lint"));
    let archive = execution.node("archive").unwrap();
    assert_eq!(archive.status, NodeStatus::Skipped);
    assert!(archive.error_message.as_deref().unwrap().contains("report"));

    assert_eq!(harness.runner.attempts("report"), 0);
    assert_eq!(harness.runner.attempts("archive"), 0);
    assert!(execution.error_message.is_none());
}
