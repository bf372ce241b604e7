//! Execution scheduler - decides which queued executions may start

use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Admission control for pipeline executions
///
/// Executions start in submission order while fewer than
/// `max_concurrent` are running.
#[derive(Debug)]
pub struct ExecutionScheduler {
    max_concurrent: usize,
    queue: VecDeque<Uuid>,
    running: HashSet<Uuid>,
}

impl ExecutionScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            queue: VecDeque::new(),
            running: HashSet::new(),
        }
    }

    /// Add an execution to the back of the queue
    pub fn enqueue(&mut self, execution_id: Uuid) {
        if !self.queue.contains(&execution_id) && !self.running.contains(&execution_id) {
            self.queue.push_back(execution_id);
        }
    }

    /// Pop as many queued executions as there are free slots and mark
    /// them running
    pub fn admit(&mut self) -> Vec<Uuid> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrent {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(id);
            admitted.push(id);
        }
        admitted
    }

    /// Release the slot held by a finished execution
    pub fn finish(&mut self, execution_id: &Uuid) -> bool {
        self.running.remove(execution_id)
    }

    /// Drop a queued execution that has not started yet
    pub fn dequeue(&mut self, execution_id: &Uuid) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != execution_id);
        self.queue.len() != before
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }
}
