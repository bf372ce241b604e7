//! Test utilities for orchestrator scenarios

use async_trait::async_trait;
use pipeline_engine::config::{ExecutorConfig, SchedulerConfig};
use pipeline_engine::core::{
    Execution, ExecutionContext, Node, NodeType, Pipeline, PipelineError, TriggerInfo,
};
use pipeline_engine::execution::{
    CancelSignal, ExecutionEvent, FnObserver, Orchestrator, StepDescriptor, StepKind, StepResult,
    StepRunner, StepStatus,
};
use pipeline_engine::logging::NullSink;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// What the mock runner does for one attempt of a node
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(String),
    Fail(String),
    /// Succeed after the delay, unless the step timeout or a cancellation
    /// comes first
    Sleep(Duration),
}

pub fn fail(message: &str) -> Behavior {
    Behavior::Fail(message.to_string())
}

pub fn succeed(stdout: &str) -> Behavior {
    Behavior::Succeed(stdout.to_string())
}

/// Step runner driven by per-node scripts instead of processes
///
/// Nodes without a script (or whose script ran out) succeed immediately.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<(String, String)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, node_id: &str, behaviors: impl IntoIterator<Item = Behavior>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), behaviors.into_iter().collect());
        self
    }

    /// Attempts made for `node_id`
    pub fn attempts(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .count()
    }

    /// Commands run for `node_id`, after placeholder substitution
    pub fn commands(&self, node_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Node ids in the order their steps started
    pub fn order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(
        &self,
        step: &StepDescriptor,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> StepResult {
        let command = match &step.kind {
            StepKind::Command { command } => ctx.substitute(command),
            other => other.name().to_string(),
        };
        self.calls.lock().unwrap().push((step.id.clone(), command));
        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&step.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| succeed("ok"));

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = match behavior {
            Behavior::Succeed(stdout) => StepResult::succeeded(&step.id, stdout),
            Behavior::Fail(message) => {
                StepResult::failed(&step.id, PipelineError::Execution(message))
            }
            Behavior::Sleep(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => StepResult::succeeded(&step.id, "slept"),
                _ = tokio::time::sleep(step.timeout) => StepResult::empty(
                    &step.id,
                    StepStatus::TimedOut,
                    Some(PipelineError::Timeout { seconds: step.timeout.as_secs() }),
                ),
                _ = cancel.cancelled() => StepResult::empty(
                    &step.id,
                    StepStatus::Cancelled,
                    Some(PipelineError::Cancelled("step cancelled".to_string())),
                ),
            },
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Build node whose command is `make <id>`
pub fn build(id: &str) -> Node {
    Node::new(NodeType::Build, id)
        .with_id(id)
        .with_config("build_command", format!("make {}", id))
}

/// Pipeline from nodes and `(from, to)` edges
pub fn pipeline(name: &str, nodes: Vec<Node>, edges: &[(&str, &str)]) -> Pipeline {
    let mut pipeline = Pipeline::new(name, "");
    for node in nodes {
        pipeline.add_node(node).unwrap();
    }
    for (from, to) in edges {
        pipeline.connect(from, to).unwrap();
    }
    pipeline
}

pub fn linear() -> Pipeline {
    pipeline(
        "linear",
        vec![build("a"), build("b"), build("c")],
        &[("a", "b"), ("b", "c")],
    )
}

pub fn diamond() -> Pipeline {
    pipeline(
        "diamond",
        vec![build("a"), build("b"), build("c"), build("d")],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    )
}

/// Scheduler settings with short backoff and polling
pub fn fast_config(workspace: &TempDir) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_pipelines: 2,
        max_concurrent_nodes: 4,
        poll_interval_ms: 20,
        retry_backoff_base_ms: 5,
        retry_backoff_cap_secs: 1,
        workspace_dir: workspace.path().to_path_buf(),
        ..SchedulerConfig::default()
    }
}

pub fn fast_executor() -> ExecutorConfig {
    ExecutorConfig {
        termination_grace_secs: 1,
        ..ExecutorConfig::default()
    }
}

/// A started orchestrator over a [`ScriptedRunner`] that records events
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub runner: Arc<ScriptedRunner>,
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
    pub workspace: TempDir,
}

impl Harness {
    pub fn new(runner: ScriptedRunner) -> Self {
        Self::with_config(runner, |_| {})
    }

    pub fn with_config(runner: ScriptedRunner, tune: impl FnOnce(&mut SchedulerConfig)) -> Self {
        let workspace = TempDir::new().unwrap();
        let mut config = fast_config(&workspace);
        tune(&mut config);

        let runner = Arc::new(runner);
        let orchestrator =
            Orchestrator::new(config, fast_executor(), runner.clone(), Arc::new(NullSink));
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        orchestrator.subscribe(
            "recorder",
            Arc::new(FnObserver::new(move |event: &ExecutionEvent| {
                recorded.lock().unwrap().push(event.clone());
            })),
        );
        orchestrator.start();

        Self {
            orchestrator,
            runner,
            events,
            workspace,
        }
    }

    pub async fn submit(&self, pipeline: Pipeline) -> Uuid {
        self.orchestrator
            .submit(pipeline, TriggerInfo::manual("tester"), HashMap::new())
            .await
            .unwrap()
    }

    /// Submit and wait for a terminal status
    pub async fn run(&self, pipeline: Pipeline) -> Execution {
        let id = self.submit(pipeline).await;
        self.wait(id).await
    }

    pub async fn wait(&self, id: Uuid) -> Execution {
        tokio::time::timeout(Duration::from_secs(20), self.orchestrator.wait(id))
            .await
            .expect("execution did not finish in time")
            .expect("execution is tracked")
    }

    /// Poll until `node_id` of `id` has started
    pub async fn wait_for_running(&self, id: Uuid, node_id: &str) {
        for _ in 0..200 {
            let running = self
                .orchestrator
                .execution(id)
                .and_then(|e| e.node(node_id).map(|n| n.status))
                == Some(pipeline_engine::core::NodeStatus::Running);
            if running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {} never started", node_id);
    }

    /// Shut down and return every event observers received
    pub async fn finish(self) -> Vec<ExecutionEvent> {
        self.orchestrator.shutdown().await;
        let events = self.events.lock().unwrap().clone();
        events
    }
}
