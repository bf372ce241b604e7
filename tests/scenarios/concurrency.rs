//! Test: node and pipeline concurrency limits

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, NodeStatus};
use std::time::Duration;

#[tokio::test]
async fn test_stage_parallelism_is_bounded() {
    let ids: Vec<String> = (0..6).map(|i| format!("shard{}", i)).collect();
    let mut runner = ScriptedRunner::new();
    for id in &ids {
        runner = runner.script(id, [Behavior::Sleep(Duration::from_millis(100))]);
    }
    let harness = Harness::with_config(runner, |c| c.max_concurrent_nodes = 2);
    let nodes = ids.iter().map(|id| build(id)).collect();
    let execution = harness.run(pipeline("fan-out", nodes, &[])).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.stages.len(), 1);
    assert_eq!(execution.count_with_status(NodeStatus::Completed), 6);
    assert_eq!(harness.runner.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_pipeline_admission_is_bounded() {
    let runner = ScriptedRunner::new()
        .script("first", [Behavior::Sleep(Duration::from_millis(300))])
        .script("second", [Behavior::Sleep(Duration::from_millis(10))]);
    let harness = Harness::with_config(runner, |c| c.max_concurrent_pipelines = 1);

    let first = harness
        .submit(pipeline("one", vec![build("first")], &[]))
        .await;
    harness.wait_for_running(first, "first").await;
    let second = harness
        .submit(pipeline("two", vec![build("second")], &[]))
        .await;

    assert_eq!(harness.orchestrator.running_count(), 1);
    assert_eq!(harness.orchestrator.queued_count(), 1);
    let queued = harness.orchestrator.status(second).unwrap();
    assert_eq!(queued.status, ExecutionStatus::Queued);
    assert_eq!(queued.progress_percentage, 0.0);

    let first = harness.wait(first).await;
    let second = harness.wait(second).await;
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
    assert_eq!(harness.runner.order(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_independent_pipelines_run_together() {
    let runner = ScriptedRunner::new()
        .script("left", [Behavior::Sleep(Duration::from_millis(200))])
        .script("right", [Behavior::Sleep(Duration::from_millis(200))]);
    let harness = Harness::with_config(runner, |c| c.max_concurrent_pipelines = 2);

    let left = harness.submit(pipeline("left", vec![build("left")], &[])).await;
    let right = harness
        .submit(pipeline("right", vec![build("right")], &[]))
        .await;
    harness.wait(left).await;
    harness.wait(right).await;

    assert_eq!(harness.runner.peak_concurrency(), 2);
}
