//! Execution lifecycle events and the observer bus
//!
//! Each observer owns a bounded channel and a task draining it, so a slow
//! or failing observer only ever loses its own events.

use crate::core::NodeStatus;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionQueued {
        execution_id: Uuid,
        pipeline_id: String,
    },
    ExecutionStarted {
        execution_id: Uuid,
        pipeline_id: String,
        pipeline_name: String,
        total_stages: usize,
    },
    StageStarted {
        execution_id: Uuid,
        stage: usize,
        nodes: Vec<String>,
    },
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        attempt: u32,
    },
    NodeRetrying {
        execution_id: Uuid,
        node_id: String,
        attempt: u32,
        delay_secs: f64,
        error: String,
    },
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        status: NodeStatus,
        error: Option<String>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        duration_secs: Option<f64>,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        cancelled_by: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionQueued { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::StageStarted { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeRetrying { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }

    /// Final event of an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionCompleted { .. }
                | ExecutionEvent::ExecutionFailed { .. }
                | ExecutionEvent::ExecutionCancelled { .. }
        )
    }
}

/// Receives lifecycle events on its own task
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

/// Observer built from a closure
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&ExecutionEvent) + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F> ExecutionObserver for FnObserver<F>
where
    F: Fn(&ExecutionEvent) + Send + Sync + 'static,
{
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        (self.0)(event);
        Ok(())
    }
}

struct ObserverSlot {
    name: String,
    sender: mpsc::Sender<ExecutionEvent>,
}

/// Fan-out of execution events to registered observers
pub struct EventBus {
    capacity: usize,
    slots: Mutex<Vec<ObserverSlot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer; must be called inside a tokio runtime
    pub fn subscribe(&self, name: impl Into<String>, observer: Arc<dyn ExecutionObserver>) {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(self.capacity);
        let task = tokio::spawn(observe(name.clone(), observer, receiver));
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ObserverSlot { name, sender });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn observer_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver without waiting; a full observer queue loses this event
    pub fn publish(&self, event: ExecutionEvent) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Observer '{}' is lagging, dropped {:?}", slot.name, event);
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Observer '{}' stopped, removing it", slot.name);
                false
            }
        });
    }

    /// Stop accepting events and wait for observers to drain their queues
    pub async fn close(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Observer task ended abnormally: {}", e);
            }
        }
    }
}

async fn observe(
    name: String,
    observer: Arc<dyn ExecutionObserver>,
    mut receiver: mpsc::Receiver<ExecutionEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let handler = observer.clone();
        // a panic stays inside the spawned task and surfaces as a JoinError
        let delivery = tokio::spawn(async move { handler.on_event(&event).await });
        match delivery.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Observer '{}' failed: {:#}", name, e),
            Err(e) if e.is_panic() => warn!("Observer '{}' panicked", name),
            Err(e) => warn!("Observer '{}' delivery aborted: {}", name, e),
        }
    }
    debug!("Observer '{}' finished", name);
}
