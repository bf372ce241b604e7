//! Test: node timeouts

use crate::helpers::*;
use pipeline_engine::core::{ExecutionStatus, NodeStatus};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_timeout_is_terminal_and_not_retried() {
    let runner = ScriptedRunner::new().script(
        "slow",
        [
            Behavior::Sleep(Duration::from_secs(10)),
            Behavior::Sleep(Duration::from_secs(10)),
        ],
    );
    let harness = Harness::new(runner);
    let p = pipeline(
        "slow",
        vec![build("slow").with_timeout(1).with_retries(1), build("after")],
        &[("slow", "after")],
    );

    let started = Instant::now();
    let execution = harness.run(p).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let node = execution.node("slow").unwrap();
    assert_eq!(node.status, NodeStatus::Timeout);
    assert_eq!(node.retry_count, 0);
    assert!(node.duration.unwrap() < 3.0);
    assert!(node.error_message.as_deref().unwrap().contains("timed out"));
    assert_eq!(harness.runner.attempts("slow"), 1);
    assert_eq!(execution.node("after").unwrap().status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_tolerated_timeout_skips_dependents() {
    let runner =
        ScriptedRunner::new().script("smoke", [Behavior::Sleep(Duration::from_secs(10))]);
    let harness = Harness::new(runner);
    let p = pipeline(
        "smoke",
        vec![
            build("smoke").with_timeout(1).with_continue_on_error(true),
            build("after"),
        ],
        &[("smoke", "after")],
    );
    let execution = harness.run(p).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.node("smoke").unwrap().status, NodeStatus::Timeout);
    assert_eq!(execution.node("after").unwrap().status, NodeStatus::Skipped);
}

#[cfg(unix)]
mod real_processes {
    use super::*;
    use pipeline_engine::core::TriggerInfo;
    use pipeline_engine::logging::NullSink;
    use pipeline_engine::{EngineConfig, Orchestrator};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;

    fn orchestrator(workspace: &tempfile::TempDir) -> Orchestrator {
        let config = EngineConfig {
            scheduler: fast_config(workspace),
            executor: fast_executor(),
            ..EngineConfig::default()
        };
        let orchestrator = Orchestrator::from_config(&config, Arc::new(NullSink));
        orchestrator.start();
        orchestrator
    }

    /// Build step whose background child touches `marker` unless it is killed first
    fn sleepy(marker: &Path, timeout: i64) -> pipeline_engine::core::Pipeline {
        let command = format!("(sleep 3; touch {}) & sleep 10", marker.display());
        pipeline(
            "sleepy",
            vec![build("sleepy")
                .with_config("build_command", command)
                .with_timeout(timeout)],
            &[],
        )
    }

    #[tokio::test]
    async fn test_real_process_is_killed_on_timeout() {
        let workspace = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let marker = scratch.path().join("survived");
        let orchestrator = orchestrator(&workspace);

        let started = Instant::now();
        let id = orchestrator
            .submit(sleepy(&marker, 1), TriggerInfo::manual("tester"), HashMap::new())
            .await
            .unwrap();
        let execution = tokio::time::timeout(Duration::from_secs(8), orchestrator.wait(id))
            .await
            .expect("timed out node settles")
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node("sleepy").unwrap().status, NodeStatus::Timeout);

        // the whole process group is gone once the grace period is over
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_real_process_is_killed_on_cancel() {
        let workspace = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let marker = scratch.path().join("survived");
        let orchestrator = orchestrator(&workspace);

        let id = orchestrator
            .submit(sleepy(&marker, 60), TriggerInfo::manual("tester"), HashMap::new())
            .await
            .unwrap();
        for _ in 0..200 {
            let running = orchestrator
                .execution(id)
                .and_then(|e| e.node("sleepy").map(|n| n.status))
                == Some(NodeStatus::Running);
            if running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(orchestrator.cancel(id, "tester").await);
        let execution = tokio::time::timeout(Duration::from_secs(8), orchestrator.wait(id))
            .await
            .expect("cancelled execution settles")
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!marker.exists());
        orchestrator.shutdown().await;
    }
}
