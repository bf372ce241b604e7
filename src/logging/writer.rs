//! Background persistence of log entries to rotating files
//!
//! Files are JSON lines named `<key>_<YYYYMMDD>[.<n>].log`, where the key is
//! `pipeline_<id>`, `step_<id>` or `system`. With compression on, each line
//! is written as its own zstd frame and the file gets a `.zst` suffix;
//! readers decode the concatenated frames in one pass.

use crate::logging::entry::LogEntry;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const COMPRESSION_LEVEL: i32 = 3;

pub(crate) enum WriterCommand {
    Write(LogEntry),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct WriterSettings {
    pub dir: PathBuf,
    pub compression: bool,
    pub max_file_bytes: u64,
}

struct OpenLog {
    day: String,
    index: u32,
    file: File,
    bytes: u64,
    dirty: bool,
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File key an entry belongs to
pub(crate) fn file_key(entry: &LogEntry) -> String {
    match (&entry.pipeline_id, &entry.step_id) {
        (Some(pipeline), _) => format!("pipeline_{}", sanitize(pipeline)),
        (None, Some(step)) => format!("step_{}", sanitize(step)),
        (None, None) => "system".to_string(),
    }
}

/// Glob-free prefix that selects every file of one pipeline
pub(crate) fn pipeline_prefix(pipeline_id: &str) -> String {
    format!("pipeline_{}_", sanitize(pipeline_id))
}

fn file_name(key: &str, day: &str, index: u32, compression: bool) -> String {
    let rotation = if index == 0 {
        String::new()
    } else {
        format!(".{}", index)
    };
    let suffix = if compression { ".log.zst" } else { ".log" };
    format!("{}_{}{}{}", key, day, rotation, suffix)
}

pub(crate) fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".log") || n.ends_with(".log.zst"))
}

pub(crate) struct LogWriter {
    settings: WriterSettings,
    open: HashMap<String, OpenLog>,
}

impl LogWriter {
    pub(crate) fn new(settings: WriterSettings) -> Self {
        Self {
            settings,
            open: HashMap::new(),
        }
    }

    /// Process commands until shutdown or until every sender is gone
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
        while let Some(command) = rx.recv().await {
            let mut pending = vec![command];
            while let Ok(more) = rx.try_recv() {
                pending.push(more);
            }

            let mut stop = false;
            let mut acks = Vec::new();
            for command in pending {
                match command {
                    WriterCommand::Write(entry) => {
                        if let Err(e) = self.write(&entry).await {
                            warn!("Failed to persist log entry: {}", e);
                        }
                    }
                    WriterCommand::Flush(ack) => acks.push(ack),
                    WriterCommand::Shutdown => stop = true,
                }
            }

            self.flush_all().await;
            for ack in acks {
                let _ = ack.send(());
            }
            if stop {
                break;
            }
        }
        self.flush_all().await;
        debug!("Log writer stopped");
    }

    async fn write(&mut self, entry: &LogEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        let bytes = if self.settings.compression {
            zstd::bulk::compress(&line, COMPRESSION_LEVEL)?
        } else {
            line
        };

        let key = file_key(entry);
        let day = entry.timestamp.format("%Y%m%d").to_string();
        let needs_rotation = match self.open.get(&key) {
            None => true,
            Some(log) => log.day != day || log.bytes >= self.settings.max_file_bytes,
        };
        if needs_rotation {
            let start = match self.open.remove(&key) {
                Some(mut previous) => {
                    previous.file.flush().await?;
                    if previous.day == day {
                        previous.index + 1
                    } else {
                        0
                    }
                }
                None => 0,
            };
            let log = self.open_log(&key, &day, start).await?;
            self.open.insert(key.clone(), log);
        }

        if let Some(log) = self.open.get_mut(&key) {
            log.file.write_all(&bytes).await?;
            log.bytes += bytes.len() as u64;
            log.dirty = true;
        }
        Ok(())
    }

    /// First file for (key, day) at or after `start` that still has room
    async fn open_log(&self, key: &str, day: &str, start: u32) -> io::Result<OpenLog> {
        let mut index = start;
        loop {
            let path = self
                .settings
                .dir
                .join(file_name(key, day, index, self.settings.compression));
            let existing = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e),
            };
            if existing >= self.settings.max_file_bytes {
                index += 1;
                continue;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            return Ok(OpenLog {
                day: day.to_string(),
                index,
                file,
                bytes: existing,
                dirty: false,
            });
        }
    }

    async fn flush_all(&mut self) {
        for log in self.open.values_mut().filter(|l| l.dirty) {
            if let Err(e) = log.file.flush().await {
                warn!("Failed to flush log file: {}", e);
            }
            log.dirty = false;
        }
    }
}

/// Decode every entry in one log file; unreadable lines are skipped
pub(crate) fn read_log_file(path: &Path) -> io::Result<Vec<LogEntry>> {
    let raw = std::fs::read(path)?;
    let is_compressed = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".zst"));
    let bytes = if is_compressed {
        zstd::decode_all(raw.as_slice())?
    } else {
        raw
    };

    let text = String::from_utf8_lossy(&bytes);
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<LogEntry>(l).ok())
        .collect())
}

/// Log files in `dir`, optionally restricted to a name prefix
pub(crate) fn list_log_files(dir: &Path, prefix: Option<&str>) -> io::Result<Vec<PathBuf>> {
    let pattern = format!("{}/{}*.log*", dir.display(), prefix.unwrap_or(""));
    let paths = glob::glob(&pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .filter_map(|p| p.ok())
        .filter(|p| is_log_file(p))
        .collect();
    Ok(paths)
}

/// Remove log files last modified more than `retention` before `now`
pub(crate) fn purge_older_than(dir: &Path, retention: Duration, now: SystemTime) -> io::Result<usize> {
    let mut removed = 0;
    for path in list_log_files(dir, None)? {
        let modified = std::fs::metadata(&path)?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > retention {
            std::fs::remove_file(&path)?;
            debug!("Purged old log file {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}
