//! Pull-style log streams with bounded, drop-oldest queues

use crate::logging::entry::{LogEntry, LogFilter};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

pub(crate) type StreamRegistry = Mutex<HashMap<String, Arc<StreamQueue>>>;

/// Producer side of a stream, shared with the streamer
#[derive(Debug)]
pub(crate) struct StreamQueue {
    filter: Option<LogFilter>,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl StreamQueue {
    pub(crate) fn new(capacity: usize, filter: Option<LogFilter>) -> Self {
        Self {
            filter,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking; a full queue loses its oldest entry
    pub(crate) fn offer(&self, entry: &LogEntry) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(entry) {
                return;
            }
        }
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() >= self.capacity {
                entries.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            entries.push_back(entry.clone());
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Consumer handle returned by `LogStreamer::create_stream`
///
/// Dropping the handle unregisters the stream.
#[derive(Debug)]
pub struct LogStream {
    id: String,
    queue: Arc<StreamQueue>,
    heartbeat: Duration,
    registry: Weak<StreamRegistry>,
}

impl LogStream {
    pub(crate) fn new(
        id: String,
        queue: Arc<StreamQueue>,
        heartbeat: Duration,
        registry: Weak<StreamRegistry>,
    ) -> Self {
        Self {
            id,
            queue,
            heartbeat,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next entry, or a heartbeat after the idle window, or `None` once the
    /// stream is closed and drained
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if let Some(entry) = self.queue.pop() {
                return Some(entry);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.queue.notify.notified() => continue,
                _ = tokio::time::sleep(self.heartbeat) => return Some(LogEntry::heartbeat()),
            }
        }
    }

    /// Queued entry if one is ready
    pub fn try_next(&mut self) -> Option<LogEntry> {
        self.queue.pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Entries discarded because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(registry) = self.registry.upgrade() {
            let mut streams = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if streams
                .get(&self.id)
                .is_some_and(|q| Arc::ptr_eq(q, &self.queue))
            {
                streams.remove(&self.id);
            }
        }
    }
}
