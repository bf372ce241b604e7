//! Orchestrator - admits queued executions and drives them stage by stage
//!
//! Executions are tracked in memory. Each admitted execution runs on its own
//! task; every node of a stage runs on its own task, and the execution task
//! waits for all of them before looking at the next stage. Retries happen
//! inside the node task.

use crate::config::{EngineConfig, ExecutorConfig, SchedulerConfig};
use crate::core::{
    Execution, ExecutionContext, ExecutionReport, ExecutionStatus, Node, NodeStatus, NodeType,
    Pipeline, PipelineError, Result, TriggerInfo,
};
use crate::execution::cancel::CancelSignal;
use crate::execution::dispatch::{self, NodeEnv, NodeOutcome};
use crate::execution::events::{EventBus, ExecutionEvent, ExecutionObserver};
use crate::execution::executor::StepExecutor;
use crate::execution::scheduler::ExecutionScheduler;
use crate::execution::step::{StepRunner, StepStatus};
use crate::logging::{LogSink, ScopedLogger};
use crate::persistence::{ExecutionSummary, PersistenceBackend};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Recorded as `cancelled_by` for executions stopped by [`Orchestrator::shutdown`]
pub const SHUTDOWN_CANCELLER: &str = "system shutdown";

/// Slack on top of timeout + grace before a node attempt is abandoned
const BACKSTOP_MARGIN: Duration = Duration::from_secs(1);

const LOG_SOURCE: &str = "orchestrator";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Tracked {
    execution: Execution,
    pipeline: Arc<Pipeline>,
    cancel: CancelSignal,
    status: watch::Sender<ExecutionStatus>,
    workspace: PathBuf,
}

/// What the node tasks of one execution share
struct RunScope {
    execution_id: Uuid,
    pipeline: Arc<Pipeline>,
    cancel: CancelSignal,
    workspace: PathBuf,
    logger: ScopedLogger,
}

struct Inner {
    config: SchedulerConfig,
    executor_config: ExecutorConfig,
    runner: Arc<dyn StepRunner>,
    sink: Arc<dyn LogSink>,
    events: EventBus,
    store: OnceLock<Arc<dyn PersistenceBackend>>,
    executions: Mutex<HashMap<Uuid, Tracked>>,
    scheduler: Mutex<ExecutionScheduler>,
    wake: Notify,
    started: AtomicBool,
    shutdown: CancelSignal,
    background: Mutex<Vec<JoinHandle<()>>>,
    active: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

/// Pipeline execution orchestrator
///
/// Cheap to clone; clones share the same executions. Call
/// [`Orchestrator::start`] before submitting work and
/// [`Orchestrator::shutdown`] when done.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: SchedulerConfig,
        executor_config: ExecutorConfig,
        runner: Arc<dyn StepRunner>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        let scheduler = ExecutionScheduler::new(config.max_concurrent_pipelines);
        Self {
            inner: Arc::new(Inner {
                config,
                executor_config,
                runner,
                sink,
                events,
                store: OnceLock::new(),
                executions: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(scheduler),
                wake: Notify::new(),
                started: AtomicBool::new(false),
                shutdown: CancelSignal::new(),
                background: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Orchestrator running real processes through a [`StepExecutor`]
    pub fn from_config(config: &EngineConfig, sink: Arc<dyn LogSink>) -> Self {
        let runner = Arc::new(StepExecutor::new(config.executor.clone(), sink.clone()));
        Self::new(
            config.scheduler.clone(),
            config.executor.clone(),
            runner,
            sink,
        )
    }

    /// Write executions through to `store` at submission and completion.
    /// Only the first store set takes effect.
    pub fn with_store(self, store: Arc<dyn PersistenceBackend>) -> Self {
        if self.inner.store.set(store).is_err() {
            warn!("Persistence backend already configured, ignoring");
        }
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Spawn the admission loop and the reaper; must be called inside a
    /// tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let scheduler = tokio::spawn(Arc::clone(&self.inner).schedule_loop());
        let reaper = tokio::spawn(Arc::clone(&self.inner).reaper_loop());
        lock(&self.inner.background).extend([scheduler, reaper]);
        info!(
            "Orchestrator started (max {} pipelines, {} nodes per stage)",
            self.inner.config.max_concurrent_pipelines, self.inner.config.max_concurrent_nodes
        );
    }

    /// Cancel everything still active, then wait for execution tasks,
    /// background loops and observers to finish
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.cancel() {
            return;
        }
        info!("Orchestrator shutting down");

        let active: Vec<Uuid> = lock(&self.inner.executions)
            .iter()
            .filter(|(_, t)| !t.execution.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in active {
            self.cancel(id, SHUTDOWN_CANCELLER).await;
        }

        let handles: Vec<_> = lock(&self.inner.active).drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Execution task ended abnormally: {}", e);
            }
        }
        let background: Vec<_> = lock(&self.inner.background).drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.inner.events.close().await;
    }

    /// Queue a run of `pipeline`
    ///
    /// Only the graph shape is checked here; callers run the validator first
    /// if they want node configuration checked.
    pub async fn submit(
        &self,
        pipeline: Pipeline,
        trigger: TriggerInfo,
        environment: HashMap<String, String>,
    ) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Cancelled(
                "orchestrator is shut down".to_string(),
            ));
        }
        let stages = pipeline.compute_stages()?;

        let mut execution = Execution::new(&pipeline, stages, trigger);
        execution.environment = environment;
        execution.transition(ExecutionStatus::Queued);
        let execution_id = execution.execution_id;

        if let Some(store) = self.inner.store.get() {
            if let Err(e) = store.save_pipeline(&pipeline).await {
                warn!("Failed to persist pipeline {}: {:#}", pipeline.id(), e);
            }
        }
        self.inner.persist(&execution).await;

        info!(
            "Queued execution {} of '{}' ({} stages)",
            execution_id,
            pipeline.name(),
            execution.total_stages()
        );
        let pipeline_id = pipeline.id().to_string();
        let (status, _) = watch::channel(execution.status);
        let workspace = self.inner.config.workspace_dir.join(execution_id.to_string());
        lock(&self.inner.executions).insert(
            execution_id,
            Tracked {
                execution,
                pipeline: Arc::new(pipeline),
                cancel: CancelSignal::new(),
                status,
                workspace,
            },
        );
        self.inner.events.publish(ExecutionEvent::ExecutionQueued {
            execution_id,
            pipeline_id,
        });
        lock(&self.inner.scheduler).enqueue(execution_id);
        self.inner.wake.notify_one();

        Ok(execution_id)
    }

    /// Cancel a queued or running execution
    ///
    /// Running nodes are marked Cancelled and their steps are signalled;
    /// nodes that never started stay Pending. Returns false if the execution
    /// is unknown or already finished.
    pub async fn cancel(&self, execution_id: Uuid, cancelled_by: impl Into<String>) -> bool {
        let cancelled_by = cancelled_by.into();
        let (snapshot, interrupted) = {
            let mut executions = lock(&self.inner.executions);
            let Some(tracked) = executions.get_mut(&execution_id) else {
                return false;
            };
            if !tracked.execution.transition(ExecutionStatus::Cancelled) {
                return false;
            }
            lock(&self.inner.scheduler).dequeue(&execution_id);

            let execution = &mut tracked.execution;
            execution.cancelled_by = Some(cancelled_by.clone());
            execution.error_message = Some(format!("cancelled by {}", cancelled_by));
            let mut interrupted = Vec::new();
            for record in execution.node_executions.values_mut() {
                if record.status == NodeStatus::Running
                    && record.transition(NodeStatus::Cancelled)
                {
                    record.error_message = Some("execution cancelled".to_string());
                    interrupted.push(record.node_id.clone());
                }
            }
            tracked.cancel.cancel();
            tracked.status.send_replace(ExecutionStatus::Cancelled);
            (tracked.execution.clone(), interrupted)
        };

        for node_id in interrupted {
            self.inner.events.publish(ExecutionEvent::NodeCompleted {
                execution_id,
                node_id,
                status: NodeStatus::Cancelled,
                error: Some("execution cancelled".to_string()),
            });
        }
        self.inner.persist(&snapshot).await;
        warn!("Execution {} cancelled by {}", execution_id, cancelled_by);
        ScopedLogger::new(self.inner.sink.clone(), LOG_SOURCE)
            .for_pipeline(&snapshot.pipeline_id)
            .warn(&format!("Execution {} cancelled by {}", execution_id, cancelled_by));
        self.inner.events.publish(ExecutionEvent::ExecutionCancelled {
            execution_id,
            cancelled_by: Some(cancelled_by),
        });
        self.inner.wake.notify_one();
        true
    }

    /// Status report of a tracked execution
    pub fn status(&self, execution_id: Uuid) -> Option<ExecutionReport> {
        lock(&self.inner.executions)
            .get(&execution_id)
            .map(|t| t.execution.report())
    }

    /// Snapshot of a tracked execution
    pub fn execution(&self, execution_id: Uuid) -> Option<Execution> {
        lock(&self.inner.executions)
            .get(&execution_id)
            .map(|t| t.execution.clone())
    }

    /// Tracked executions, newest first
    pub fn list_executions(&self) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<ExecutionSummary> = lock(&self.inner.executions)
            .values()
            .map(|t| ExecutionSummary::from(&t.execution))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Resolve once the execution reaches a terminal status
    pub async fn wait(&self, execution_id: Uuid) -> Option<Execution> {
        let mut status = lock(&self.inner.executions)
            .get(&execution_id)?
            .status
            .subscribe();
        status.wait_for(ExecutionStatus::is_terminal).await.ok()?;
        self.execution(execution_id)
    }

    /// Register an observer of lifecycle events
    pub fn subscribe(&self, name: impl Into<String>, observer: Arc<dyn ExecutionObserver>) {
        self.inner.events.subscribe(name, observer);
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.scheduler).running_count()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.inner.scheduler).queued_count()
    }

    /// Drop terminal executions older than the retention window
    pub async fn reap_expired(&self) -> usize {
        self.inner.reap_expired().await
    }
}

impl Inner {
    async fn schedule_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
            self.admit();
        }
        debug!("Scheduler loop stopped");
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reaper_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.reap_expired().await;
                }
            }
        }
        debug!("Reaper loop stopped");
    }

    /// Start as many queued executions as there are free slots
    fn admit(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let admitted = lock(&self.scheduler).admit();
        if admitted.is_empty() {
            return;
        }
        let mut active = lock(&self.active);
        active.retain(|_, handle| !handle.is_finished());
        for execution_id in admitted {
            debug!("Admitting execution {}", execution_id);
            let inner = Arc::clone(self);
            active.insert(
                execution_id,
                tokio::spawn(async move { inner.run_execution(execution_id).await }),
            );
        }
    }

    async fn reap_expired(&self) -> usize {
        let retention = self.config.retention();
        let now = Utc::now();
        let expired: Vec<Tracked> = {
            let mut executions = lock(&self.executions);
            let ids: Vec<Uuid> = executions
                .iter()
                .filter(|(_, t)| {
                    t.execution.status.is_terminal()
                        && t.execution.completed_at.is_some_and(|done| {
                            (now - done).to_std().is_ok_and(|age| age >= retention)
                        })
                })
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| executions.remove(id)).collect()
        };

        if self.config.cleanup_workspaces {
            for tracked in &expired {
                match tokio::fs::remove_dir_all(&tracked.workspace).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(
                        "Failed to remove workspace {}: {}",
                        tracked.workspace.display(),
                        e
                    ),
                }
            }
        }
        if !expired.is_empty() {
            info!("Reaped {} finished executions", expired.len());
        }
        expired.len()
    }

    async fn persist(&self, execution: &Execution) {
        if let Some(store) = self.store.get() {
            if let Err(e) = store.save_execution(execution).await {
                warn!(
                    "Failed to persist execution {}: {:#}",
                    execution.execution_id, e
                );
            }
        }
    }

    fn with_execution<R>(&self, execution_id: Uuid, f: impl FnOnce(&mut Execution) -> R) -> Option<R> {
        lock(&self.executions)
            .get_mut(&execution_id)
            .map(|t| f(&mut t.execution))
    }

    /// Move a Queued execution to Running and gather what its tasks need
    fn begin(&self, execution_id: Uuid) -> Option<(Arc<RunScope>, Vec<Vec<String>>)> {
        let mut executions = lock(&self.executions);
        let tracked = executions.get_mut(&execution_id)?;
        if !tracked.execution.transition(ExecutionStatus::Running) {
            return None;
        }
        tracked.status.send_replace(ExecutionStatus::Running);
        let scope = RunScope {
            execution_id,
            pipeline: Arc::clone(&tracked.pipeline),
            cancel: tracked.cancel.clone(),
            workspace: tracked.workspace.clone(),
            logger: ScopedLogger::new(self.sink.clone(), LOG_SOURCE)
                .for_pipeline(tracked.pipeline.id()),
        };
        Some((Arc::new(scope), tracked.execution.stages.clone()))
    }

    async fn run_execution(self: Arc<Self>, execution_id: Uuid) {
        if let Some((run, stages)) = self.begin(execution_id) {
            self.drive(&run, &stages).await;
        }
        lock(&self.scheduler).finish(&execution_id);
        lock(&self.active).remove(&execution_id);
        self.wake.notify_one();
    }

    async fn drive(self: &Arc<Self>, run: &Arc<RunScope>, stages: &[Vec<String>]) {
        let execution_id = run.execution_id;
        info!(
            "Starting execution {} of '{}'",
            execution_id,
            run.pipeline.name()
        );
        run.logger.info(&format!(
            "Execution {} started with {} stages",
            execution_id,
            stages.len()
        ));
        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            pipeline_id: run.pipeline.id().to_string(),
            pipeline_name: run.pipeline.name().to_string(),
            total_stages: stages.len(),
        });

        if let Err(e) = tokio::fs::create_dir_all(&run.workspace).await {
            let message = format!(
                "failed to create workspace {}: {}",
                run.workspace.display(),
                e
            );
            self.finish(run, ExecutionStatus::Failed, Some(message)).await;
            return;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_nodes.max(1)));
        for (index, stage) in stages.iter().enumerate() {
            if run.cancel.is_cancelled() {
                return;
            }
            self.with_execution(execution_id, |e| e.current_stage = index);
            debug!("Execution {} stage {}: {:?}", execution_id, index, stage);
            self.events.publish(ExecutionEvent::StageStarted {
                execution_id,
                stage: index,
                nodes: stage.clone(),
            });

            let handles: Vec<_> = stage
                .iter()
                .map(|node_id| {
                    let inner = Arc::clone(self);
                    let run = Arc::clone(run);
                    let permits = Arc::clone(&permits);
                    let task_node = node_id.clone();
                    let handle = tokio::spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        inner.run_node(&run, &task_node).await;
                    });
                    (node_id.clone(), handle)
                })
                .collect();

            // stage barrier
            for (node_id, handle) in handles {
                if let Err(e) = handle.await {
                    error!("Node task {} of {} ended abnormally: {}", node_id, execution_id, e);
                    self.mark_aborted(run, &node_id, &e.to_string());
                }
            }

            if run.cancel.is_cancelled() {
                return;
            }
            let failures = self
                .with_execution(execution_id, |e| {
                    e.current_stage = index + 1;
                    blocking_failures(&run.pipeline, e, stage)
                })
                .unwrap_or_default();
            if !failures.is_empty() {
                self.finish(run, ExecutionStatus::Failed, Some(failures.join("; ")))
                    .await;
                return;
            }
        }

        self.finish(run, ExecutionStatus::Completed, None).await;
    }

    /// Terminal transition, write-through and terminal event
    async fn finish(&self, run: &RunScope, status: ExecutionStatus, error: Option<String>) {
        let execution_id = run.execution_id;
        let snapshot = {
            let mut executions = lock(&self.executions);
            let Some(tracked) = executions.get_mut(&execution_id) else {
                return;
            };
            if !tracked.execution.transition(status) {
                return;
            }
            tracked.execution.error_message = error.clone();
            tracked.status.send_replace(status);
            tracked.execution.clone()
        };
        self.persist(&snapshot).await;

        let event = match (status, error) {
            (ExecutionStatus::Completed, _) => {
                let duration_secs = snapshot
                    .started_at
                    .zip(snapshot.completed_at)
                    .map(|(start, end)| (end - start).num_milliseconds() as f64 / 1000.0);
                info!("Execution {} completed", execution_id);
                run.logger
                    .info(&format!("Execution {} completed", execution_id));
                ExecutionEvent::ExecutionCompleted {
                    execution_id,
                    duration_secs,
                }
            }
            (_, error) => {
                let error = error.unwrap_or_else(|| status.as_str().to_string());
                warn!("Execution {} failed: {}", execution_id, error);
                run.logger
                    .error(&format!("Execution {} failed: {}", execution_id, error));
                ExecutionEvent::ExecutionFailed {
                    execution_id,
                    error,
                }
            }
        };
        self.events.publish(event);
    }

    /// A node task that panicked still has to leave a terminal record
    fn mark_aborted(&self, run: &RunScope, node_id: &str, reason: &str) {
        let message = format!("node task aborted: {}", reason);
        let marked = self
            .with_execution(run.execution_id, |e| {
                let record = e.node_mut(node_id)?;
                if record.status.is_terminal() && record.status != NodeStatus::Failed {
                    return None;
                }
                if record.status == NodeStatus::Pending {
                    record.transition(NodeStatus::Running);
                }
                record.status = NodeStatus::Failed;
                record.completed_at = Some(Utc::now());
                record.error_message = Some(message.clone());
                Some(())
            })
            .flatten();
        if marked.is_some() {
            self.events.publish(ExecutionEvent::NodeCompleted {
                execution_id: run.execution_id,
                node_id: node_id.to_string(),
                status: NodeStatus::Failed,
                error: Some(message),
            });
        }
    }

    async fn run_node(&self, run: &RunScope, node_id: &str) {
        let Some(node) = run.pipeline.node(node_id) else {
            return;
        };
        if run.cancel.is_cancelled() {
            return;
        }
        let logger = run.logger.clone().for_step(&node.id);

        let skip = self
            .with_execution(run.execution_id, |e| skip_reason(&run.pipeline, e, node))
            .flatten();
        if let Some(reason) = skip {
            let skipped = self
                .with_execution(run.execution_id, |e| {
                    e.node_mut(&node.id).is_some_and(|record| {
                        let moved = record.transition(NodeStatus::Skipped);
                        if moved {
                            record.error_message = Some(reason.clone());
                        }
                        moved
                    })
                })
                .unwrap_or(false);
            if skipped {
                logger.info(&format!("Skipped '{}': {}", node.name, reason));
                self.events.publish(ExecutionEvent::NodeCompleted {
                    execution_id: run.execution_id,
                    node_id: node.id.clone(),
                    status: NodeStatus::Skipped,
                    error: Some(reason),
                });
            }
            return;
        }

        loop {
            let started = self
                .with_execution(run.execution_id, |e| {
                    let record = e.node_mut(&node.id)?;
                    if !record.transition(NodeStatus::Running) {
                        return None;
                    }
                    let attempt = record.retry_count + 1;
                    let ctx = ExecutionContext::for_node(&run.pipeline, e, node, &run.workspace);
                    Some((attempt, ctx))
                })
                .flatten();
            let Some((attempt, ctx)) = started else {
                return;
            };
            self.events.publish(ExecutionEvent::NodeStarted {
                execution_id: run.execution_id,
                node_id: node.id.clone(),
                attempt,
            });
            logger.info(&format!("Running '{}' (attempt {})", node.name, attempt));

            let outcome = self.attempt(run, node, &logger, &ctx).await;
            let status = match outcome.status {
                StepStatus::Succeeded => NodeStatus::Completed,
                StepStatus::TimedOut => NodeStatus::Timeout,
                StepStatus::Cancelled => NodeStatus::Cancelled,
                StepStatus::Failed => NodeStatus::Failed,
            };
            let error = outcome.error.as_ref().map(ToString::to_string);

            let retry = self
                .with_execution(run.execution_id, |e| {
                    self.record_outcome(e, node, status, outcome)
                })
                .flatten();
            let Some(retry) = retry else {
                // lost against a cancellation
                return;
            };

            match retry {
                Some(retry) if !run.cancel.is_cancelled() => {
                    let delay = self.config.retry_backoff(retry);
                    let error = error.unwrap_or_default();
                    info!(
                        "Retrying node {} of {} in {:?} (retry {}/{})",
                        node.id, run.execution_id, delay, retry, node.retry_count
                    );
                    logger.warn(&format!(
                        "Attempt {} failed: {}; retrying in {:.1}s",
                        attempt,
                        error,
                        delay.as_secs_f64()
                    ));
                    self.events.publish(ExecutionEvent::NodeRetrying {
                        execution_id: run.execution_id,
                        node_id: node.id.clone(),
                        attempt: attempt + 1,
                        delay_secs: delay.as_secs_f64(),
                        error,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = run.cancel.cancelled() => {}
                    }
                    if run.cancel.is_cancelled() {
                        self.settle_cancelled_retry(run, node);
                        return;
                    }
                }
                Some(_) => {
                    self.settle_cancelled_retry(run, node);
                    return;
                }
                None => {
                    match status {
                        NodeStatus::Completed => {
                            logger.info(&format!("Completed '{}'", node.name));
                        }
                        NodeStatus::Failed if node.retry_count > 0 => {
                            logger.error(&format!(
                                "'{}' failed after {} attempts: {}",
                                node.name,
                                attempt,
                                error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                        _ => {
                            logger.error(&format!(
                                "'{}' {}: {}",
                                node.name,
                                status.as_str(),
                                error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                    }
                    self.events.publish(ExecutionEvent::NodeCompleted {
                        execution_id: run.execution_id,
                        node_id: node.id.clone(),
                        status,
                        error,
                    });
                    return;
                }
            }
        }
    }

    /// One attempt, bounded by the node timeout
    async fn attempt(
        &self,
        run: &RunScope,
        node: &Node,
        logger: &ScopedLogger,
        ctx: &ExecutionContext,
    ) -> NodeOutcome {
        let timeout = node.timeout_duration();
        let env = NodeEnv {
            runner: self.runner.as_ref(),
            config: &self.executor_config,
            logger,
            pipeline_id: run.pipeline.id(),
            workspace: &run.workspace,
            deadline: Instant::now() + timeout,
            cancel: &run.cancel,
        };
        // runners enforce the deadline themselves; this catches one that does not
        let backstop = timeout + self.executor_config.termination_grace() + BACKSTOP_MARGIN;
        match tokio::time::timeout(backstop, dispatch::run_node(&env, node, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Node {} overran its timeout, abandoning attempt", node.id);
                NodeOutcome {
                    status: StepStatus::TimedOut,
                    outputs: HashMap::new(),
                    logs: Vec::new(),
                    error: Some(PipelineError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        }
    }

    /// Apply an attempt's outcome to the node record.
    ///
    /// `None` when the record had already been resolved elsewhere, otherwise
    /// `Some(Some(n))` when retry `n` should follow and `Some(None)` when the
    /// node is settled.
    fn record_outcome(
        &self,
        execution: &mut Execution,
        node: &Node,
        status: NodeStatus,
        outcome: NodeOutcome,
    ) -> Option<Option<u32>> {
        let retryable = outcome.is_retryable();
        let record = execution.node_mut(&node.id)?;
        if !record.transition(status) {
            return None;
        }
        record.error_message = outcome.error.map(|e| e.to_string());
        record.logs.extend(outcome.logs);
        let excess = record
            .logs
            .len()
            .saturating_sub(self.executor_config.max_captured_lines);
        record.logs.drain(..excess);

        match status {
            NodeStatus::Completed => {
                record.outputs = outcome.outputs;
                let outputs = record.outputs.clone();
                execution.outputs.insert(
                    node.id.clone(),
                    Value::Object(outputs.into_iter().collect()),
                );
                Some(None)
            }
            NodeStatus::Failed if retryable && record.retry_count < node.retry_count => {
                record.retry_count += 1;
                Some(Some(record.retry_count))
            }
            _ => Some(None),
        }
    }

    /// A node waiting out its backoff when the execution was cancelled
    fn settle_cancelled_retry(&self, run: &RunScope, node: &Node) {
        let moved = self
            .with_execution(run.execution_id, |e| {
                e.node_mut(&node.id)
                    .is_some_and(|record| record.transition(NodeStatus::Cancelled))
            })
            .unwrap_or(false);
        if moved {
            self.events.publish(ExecutionEvent::NodeCompleted {
                execution_id: run.execution_id,
                node_id: node.id.clone(),
                status: NodeStatus::Cancelled,
                error: Some("execution cancelled".to_string()),
            });
        }
    }
}

/// Why `node` must not run, if it must not
fn skip_reason(pipeline: &Pipeline, execution: &Execution, node: &Node) -> Option<String> {
    for dep in &node.dependencies {
        let status = execution
            .node(dep)
            .map(|r| r.status)
            .unwrap_or(NodeStatus::Pending);
        if status != NodeStatus::Completed {
            return Some(format!(
                "dependency '{}' did not complete ({})",
                dep,
                status.as_str()
            ));
        }
    }
    for dep in &node.dependencies {
        let Some(condition) = pipeline
            .node(dep)
            .filter(|n| n.node_type == NodeType::Condition)
        else {
            continue;
        };
        let taken = execution
            .node(dep)
            .is_some_and(|r| !dispatch::branch_not_taken(condition, &r.outputs, node));
        if !taken {
            return Some(format!("branch not taken at condition '{}'", dep));
        }
    }
    None
}

/// Failed or timed-out nodes of `stage` that do not allow continuing
fn blocking_failures(pipeline: &Pipeline, execution: &Execution, stage: &[String]) -> Vec<String> {
    stage
        .iter()
        .filter_map(|id| {
            let record = execution.node(id)?;
            let tolerated = pipeline.node(id).is_some_and(|n| n.continue_on_error);
            (record.status.is_failure() && !tolerated).then(|| {
                format!(
                    "node '{}' {}: {}",
                    id,
                    record.status.as_str(),
                    record.error_message.as_deref().unwrap_or("no error recorded")
                )
            })
        })
        .collect()
}
