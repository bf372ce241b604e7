//! Central log bus: buffers recent entries, fans them out to subscribers
//! and streams, and persists them through a background writer.

use crate::config::LogConfig;
use crate::core::error::{PipelineError, Result};
use crate::logging::buffer::LogBuffer;
use crate::logging::entry::{HistoryQuery, LogEntry, LogFilter, LogLevel};
use crate::logging::sink::LogSink;
use crate::logging::stream::{LogStream, StreamQueue, StreamRegistry};
use crate::logging::writer::{self, LogWriter, WriterCommand, WriterSettings};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Push-style subscriber callback
pub type LogCallback = Arc<dyn Fn(&LogEntry) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: String,
    filter: Option<LogFilter>,
    callback: LogCallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    pub total_entries: u64,
    pub buffered: usize,
    pub buffer_capacity: usize,
    pub evicted: u64,
    pub subscribers: usize,
    pub streams: usize,
    pub running: bool,
}

struct Inner {
    config: LogConfig,
    buffer: Mutex<LogBuffer>,
    sequence: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    streams: Arc<StreamRegistry>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriterCommand>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    purge_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log bus shared by the orchestrator, executors and the CLI
///
/// Entries logged before [`LogStreamer::start`] or after
/// [`LogStreamer::shutdown`] are still buffered and delivered, only not
/// persisted.
#[derive(Clone)]
pub struct LogStreamer {
    inner: Arc<Inner>,
}

impl LogStreamer {
    pub fn new(config: LogConfig) -> Self {
        let buffer = LogBuffer::new(config.buffer_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                buffer: Mutex::new(buffer),
                sequence: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                streams: Arc::new(Mutex::new(HashMap::new())),
                writer: Mutex::new(None),
                writer_task: Mutex::new(None),
                purge_task: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Create the log directory and spawn the writer and purge tasks
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let config = &self.inner.config;
        if let Err(e) = tokio::fs::create_dir_all(&config.log_dir).await {
            self.inner.running.store(false, Ordering::Release);
            return Err(PipelineError::Io(format!(
                "cannot create log directory {}: {}",
                config.log_dir.display(),
                e
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let log_writer = LogWriter::new(WriterSettings {
            dir: config.log_dir.clone(),
            compression: config.compression,
            max_file_bytes: config.max_file_bytes.max(1),
        });
        *lock(&self.inner.writer) = Some(tx);
        *lock(&self.inner.writer_task) = Some(tokio::spawn(log_writer.run(rx)));

        let weak = Arc::downgrade(&self.inner);
        let period = config.purge_interval();
        *lock(&self.inner.purge_task) = Some(tokio::spawn(purge_loop(weak, period)));

        info!("Log streamer started (dir: {})", config.log_dir.display());
        Ok(())
    }

    /// Stop background tasks, flush pending writes and close every stream
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(purge) = lock(&self.inner.purge_task).take() {
            purge.abort();
        }
        if let Some(tx) = lock(&self.inner.writer).take() {
            let _ = tx.send(WriterCommand::Shutdown);
        }
        let writer_task = lock(&self.inner.writer_task).take();
        if let Some(handle) = writer_task {
            if let Err(e) = handle.await {
                warn!("Log writer task failed: {}", e);
            }
        }

        let streams: Vec<_> = lock(&self.inner.streams).drain().map(|(_, q)| q).collect();
        for queue in streams {
            queue.close();
        }
        info!("Log streamer stopped");
    }

    /// Record an entry and deliver it everywhere
    pub fn emit(&self, mut entry: LogEntry) {
        entry.sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        lock(&self.inner.buffer).push(entry.clone());
        self.notify_subscribers(&entry);

        let queues: Vec<_> = lock(&self.inner.streams).values().cloned().collect();
        for queue in queues {
            queue.offer(&entry);
        }

        if let Some(tx) = lock(&self.inner.writer).as_ref() {
            let _ = tx.send(WriterCommand::Write(entry));
        }
    }

    fn notify_subscribers(&self, entry: &LogEntry) {
        let snapshot: Vec<_> = lock(&self.inner.subscribers).clone();
        for subscriber in snapshot {
            if let Some(filter) = &subscriber.filter {
                if !filter.matches(entry) {
                    continue;
                }
            }
            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(entry))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Log subscriber {} failed: {}", subscriber.id, e),
                Err(_) => warn!("Log subscriber {} panicked", subscriber.id),
            }
        }
    }

    /// Register `callback` under `id`, replacing any subscriber with that id
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filter: Option<LogFilter>,
        callback: LogCallback,
    ) {
        let id = id.into();
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|s| s.id != id);
        debug!("Added log subscriber {}", id);
        subscribers.push(Arc::new(Subscriber {
            id,
            filter,
            callback,
        }));
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Open a pull-style stream of entries logged from now on
    ///
    /// Reusing an id closes the stream previously registered under it.
    pub fn create_stream(&self, id: impl Into<String>, filter: Option<LogFilter>) -> LogStream {
        let id = id.into();
        let queue = Arc::new(StreamQueue::new(
            self.inner.config.stream_queue_capacity,
            filter,
        ));
        if let Some(previous) = lock(&self.inner.streams).insert(id.clone(), queue.clone()) {
            previous.close();
        }
        LogStream::new(
            id,
            queue,
            self.inner.config.heartbeat(),
            Arc::downgrade(&self.inner.streams),
        )
    }

    pub fn close_stream(&self, id: &str) -> bool {
        match lock(&self.inner.streams).remove(id) {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Newest buffered entries matching `filter`, oldest first
    pub fn recent(&self, filter: Option<&LogFilter>, limit: usize) -> Vec<LogEntry> {
        lock(&self.inner.buffer).recent(filter, limit)
    }

    /// Buffered entries merged with persisted ones when the buffer cannot
    /// answer on its own
    pub async fn query(&self, query: HistoryQuery) -> Result<Vec<LogEntry>> {
        let (mut results, oldest) = {
            let buffer = lock(&self.inner.buffer);
            let matched: Vec<LogEntry> =
                buffer.iter().filter(|e| query.matches(e)).cloned().collect();
            (matched, buffer.oldest().map(|e| e.timestamp))
        };

        let reaches_past_buffer = match (query.start, oldest) {
            (Some(start), Some(oldest)) => start < oldest,
            _ => false,
        };
        if results.len() < query.limit || reaches_past_buffer {
            if self.is_running() {
                self.flush().await;
            }
            let dir = self.inner.config.log_dir.clone();
            let file_query = query.clone();
            let persisted = tokio::task::spawn_blocking(move || read_history(&dir, &file_query))
                .await
                .map_err(|e| PipelineError::Execution(format!("log query task failed: {}", e)))??;
            results.extend(persisted);
        }

        let mut seen = HashSet::new();
        results.retain(|e| seen.insert(e.dedup_key()));
        results.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        if results.len() > query.limit {
            results.drain(..results.len() - query.limit);
        }
        Ok(results)
    }

    /// Wait until everything logged so far has reached disk
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = match lock(&self.inner.writer).as_ref() {
            Some(tx) => tx.send(WriterCommand::Flush(ack_tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = ack_rx.await;
        }
    }

    /// Delete log files older than the retention window
    pub async fn purge_expired(&self) -> Result<usize> {
        purge(&self.inner.config).await
    }

    pub fn stats(&self) -> LogStats {
        let (buffered, buffer_capacity, evicted) = {
            let buffer = lock(&self.inner.buffer);
            (buffer.len(), buffer.capacity(), buffer.evicted())
        };
        LogStats {
            total_entries: self.inner.sequence.load(Ordering::Relaxed),
            buffered,
            buffer_capacity,
            evicted,
            subscribers: lock(&self.inner.subscribers).len(),
            streams: lock(&self.inner.streams).len(),
            running: self.is_running(),
        }
    }
}

impl LogSink for LogStreamer {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        step_id: Option<&str>,
        pipeline_id: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
    ) {
        let mut entry = LogEntry::new(level, source, message);
        entry.step_id = step_id.map(String::from);
        entry.pipeline_id = pipeline_id.map(String::from);
        entry.metadata = metadata.unwrap_or_default();
        self.emit(entry);
    }
}

fn read_history(dir: &std::path::Path, query: &HistoryQuery) -> Result<Vec<LogEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = query.pipeline_id.as_deref().map(writer::pipeline_prefix);
    let mut entries = Vec::new();
    for path in writer::list_log_files(dir, prefix.as_deref())? {
        match writer::read_log_file(&path) {
            Ok(read) => entries.extend(read.into_iter().filter(|e| query.matches(e))),
            Err(e) => warn!("Skipping unreadable log file {}: {}", path.display(), e),
        }
    }
    Ok(entries)
}

async fn purge(config: &LogConfig) -> Result<usize> {
    let dir = config.log_dir.clone();
    let retention = config.retention();
    if !dir.exists() {
        return Ok(0);
    }
    let removed = tokio::task::spawn_blocking(move || {
        writer::purge_older_than(&dir, retention, SystemTime::now())
    })
    .await
    .map_err(|e| PipelineError::Execution(format!("log purge task failed: {}", e)))??;
    if removed > 0 {
        info!("Purged {} expired log files", removed);
    }
    Ok(removed)
}

async fn purge_loop(inner: Weak<Inner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = purge(&inner.config).await {
            warn!("Log purge failed: {}", e);
        }
    }
}
