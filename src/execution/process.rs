//! Child process supervision: output streaming, timeout and the
//! terminate-then-kill escalation

use crate::core::{PipelineError, Result};
use crate::execution::cancel::CancelSignal;
use crate::logging::{LogLevel, ScopedLogger};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long reader tasks may keep draining after the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default)]
pub(crate) struct Captured {
    /// Most recent lines, bounded
    pub lines: Vec<String>,
    pub total: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug)]
pub(crate) struct ProcessOutput {
    pub outcome: ProcessOutcome,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl ProcessOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ProcessOutcome::Exited(status) => status.code(),
            _ => None,
        }
    }
}

pub(crate) struct ProcessOptions<'a> {
    pub timeout: Duration,
    pub grace: Duration,
    pub max_lines: usize,
    pub cancel: &'a CancelSignal,
    pub logger: &'a ScopedLogger,
}

/// Spawn `command` and supervise it until exit, timeout or cancellation
pub(crate) async fn run(mut command: Command, options: ProcessOptions<'_>) -> Result<ProcessOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| PipelineError::Execution(format!("failed to spawn process: {}", e)))?;
    let pid = child.id();
    debug!("Spawned process {:?}", pid);

    let stdout_task = child
        .stdout
        .take()
        .map(|out| spawn_reader(out, options.logger.clone(), LogLevel::Info, options.max_lines));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| spawn_reader(err, options.logger.clone(), LogLevel::Warning, options.max_lines));

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessOutcome::Exited(status),
            Err(e) => {
                terminate(&mut child, pid, options.grace).await;
                return Err(PipelineError::Execution(format!("failed to wait for process: {}", e)));
            }
        },
        _ = tokio::time::sleep(options.timeout) => ProcessOutcome::TimedOut,
        _ = options.cancel.cancelled() => ProcessOutcome::Cancelled,
    };

    if outcome == ProcessOutcome::TimedOut || outcome == ProcessOutcome::Cancelled {
        debug!("Terminating process {:?} ({:?})", pid, outcome);
        terminate(&mut child, pid, options.grace).await;
    }

    Ok(ProcessOutput {
        outcome,
        stdout: drain(stdout_task).await,
        stderr: drain(stderr_task).await,
    })
}

fn spawn_reader<R>(stream: R, logger: ScopedLogger, level: LogLevel, max_lines: usize) -> JoinHandle<Captured>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut kept = VecDeque::new();
        let mut total = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    total += 1;
                    logger.log(level, &line);
                    if kept.len() >= max_lines.max(1) {
                        kept.pop_front();
                    }
                    kept.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Output stream closed with error: {}", e);
                    break;
                }
            }
        }
        Captured {
            lines: kept.into(),
            total,
        }
    })
}

async fn drain(task: Option<JoinHandle<Captured>>) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            Captured::default()
        }
        Err(_) => {
            // a grandchild still holds the pipe open
            task.abort();
            Captured::default()
        }
    }
}

/// SIGTERM the process group, wait `grace`, then SIGKILL
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, "TERM").await;
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        // the leader may be gone while descendants that ignore TERM remain
        if !exited || signal_group(pid, "0").await {
            signal_group(pid, "KILL").await;
        }
        if exited {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!("Kill failed: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed process: {}", e);
    }
}

/// Send `signal` to the group led by `pid`; signal "0" only checks for live members
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    let result = Command::new("kill")
        .args([format!("-{}", signal), "--".to_string(), format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Could not send SIG{} to group {}: {}", signal, pid, e);
            false
        }
    }
}
