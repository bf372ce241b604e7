//! Test: condition nodes gate their branches

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, Node, NodeStatus, NodeType, Pipeline, TriggerInfo};
use std::collections::HashMap;

fn gated() -> Pipeline {
    let gate = Node::new(NodeType::Condition, "is production")
        .with_id("gate")
        .with_config("condition_expression", "${ENV} == 'prod'")
        .with_config("true_branch", "deploy")
        .with_config("false_branch", "preview");
    let mut p = pipeline(
        "gated",
        vec![build("compile"), gate, build("deploy"), build("preview")],
        &[("compile", "gate"), ("gate", "deploy"), ("gate", "preview")],
    );
    p.config
        .environment_variables
        .insert("ENV".to_string(), "prod".to_string());
    p
}

#[tokio::test]
async fn test_true_branch_runs() {
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(gated()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let gate = execution.node("gate").unwrap();
    assert_eq!(gate.status, NodeStatus::Completed);
    assert_eq!(gate.outputs["condition_result"], true);
    assert_eq!(gate.outputs["selected_branch"], "deploy");

    assert_eq!(execution.node("deploy").unwrap().status, NodeStatus::Completed);
    let preview = execution.node("preview").unwrap();
    assert_eq!(preview.status, NodeStatus::Skipped);
    assert!(preview
        .error_message
        .as_deref()
        .unwrap()
        .contains("branch not taken"));
    assert_eq!(harness.runner.attempts("preview"), 0);
}

#[tokio::test]
async fn test_override_selects_false_branch() {
    let harness = Harness::new(ScriptedRunner::new());
    let id = harness
        .orchestrator
        .submit(
            gated(),
            TriggerInfo::manual("tester"),
            HashMap::from([("ENV".to_string(), "staging".to_string())]),
        )
        .await
        .unwrap();
    let execution = harness.wait(id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.node("gate").unwrap().outputs["condition_result"], false);
    assert_eq!(execution.node("deploy").unwrap().status, NodeStatus::Skipped);
    assert_eq!(execution.node("preview").unwrap().status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_unlisted_dependents_always_run() {
    let mut p = gated();
    p.add_node(build("audit")).unwrap();
    p.connect("gate", "audit").unwrap();

    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness.run(p).await;

    assert_eq!(execution.node("audit").unwrap().status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_bad_expression_fails_node() {
    let gate = Node::new(NodeType::Condition, "broken")
        .with_id("gate")
        .with_config("condition_expression", "${ENV} ==");
    let harness = Harness::new(ScriptedRunner::new());
    let execution = harness
        .run(pipeline("broken", vec![gate.with_retries(2)], &[]))
        .await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let gate = execution.node("gate").unwrap();
    assert_eq!(gate.status, NodeStatus::Failed);
    // configuration problems are not retried
    assert_eq!(gate.retry_count, 0);
}
