//! Test: pipelines where every node succeeds

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, NodeStatus, TriggerInfo};
use pipeline_engine::execution::ExecutionEvent;
use std::collections::HashMap;

#[tokio::test]
async fn test_linear_pipeline_runs_in_order() {
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(linear()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.stages,
        vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
    );
    assert_eq!(harness.runner.order(), vec!["a", "b", "c"]);
    assert_eq!(execution.count_with_status(NodeStatus::Completed), 3);
    assert_eq!(execution.report().progress_percentage, 100.0);
    assert!(execution.error_message.is_none());
}

#[tokio::test]
async fn test_diamond_waits_for_both_branches() {
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(diamond()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.stages.len(), 3);
    assert_eq!(execution.stages[1], vec!["b".to_string(), "c".to_string()]);

    let order = harness.runner.order();
    let position = |id: &str| order.iter().position(|o| o == id).unwrap();
    assert!(position("a") < position("b"));
    assert!(position("a") < position("c"));
    assert!(position("b") < position("d"));
    assert!(position("c") < position("d"));

    // stage barrier: d started after both b and c finished
    let d_started = execution.node("d").unwrap().started_at.unwrap();
    for id in ["b", "c"] {
        assert!(execution.node(id).unwrap().completed_at.unwrap() <= d_started);
    }
}

#[tokio::test]
async fn test_dependency_outputs_and_overrides_are_substituted() {
    let mut p = pipeline(
        "substitution",
        vec![
            build("compile"),
            build("package").with_config(
                "build_command",
                "tar ${ENV} ${compile.exit_code} ${compile.status}",
            ),
        ],
        &[("compile", "package")],
    );
    p.config
        .environment_variables
        .insert("ENV".to_string(), "dev".to_string());

    let harness = Harness::new(ScriptedRunner::new());
    let id = harness
        .orchestrator
        .submit(
            p,
            TriggerInfo::manual("tester"),
            HashMap::from([("ENV".to_string(), "staging".to_string())]),
        )
        .await
        .unwrap();
    let execution = harness.wait(id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        harness.runner.commands("package"),
        vec!["tar staging 0 completed"]
    );
    assert_eq!(execution.outputs["compile"]["exit_code"], 0);
}

#[tokio::test]
async fn test_events_arrive_in_lifecycle_order() {
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(linear()).await;
    let id = execution.execution_id;
    let events = harness.finish().await;

    assert!(events.iter().all(|e| e.execution_id() == id));
    assert!(matches!(events[0], ExecutionEvent::ExecutionQueued { .. }));
    assert!(matches!(events[1], ExecutionEvent::ExecutionStarted { total_stages: 3, .. }));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::ExecutionCompleted { .. })
    ));
    let stages = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::StageStarted { .. }))
        .count();
    assert_eq!(stages, 3);
    let completed = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ExecutionEvent::NodeCompleted {
                    status: NodeStatus::Completed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn test_empty_pipeline_completes() {
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(pipeline("empty", vec![], &[])).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.stages.is_empty());
    assert!(harness.runner.order().is_empty());
}
