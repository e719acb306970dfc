//! Child process spawning with streaming output capture.
//!
//! Each spawned child gets:
//! - its own process group, so signals reach any helpers it forks
//! - two reader tasks forwarding stdout/stderr lines into the [`LogSink`]
//! - one watcher task that owns the OS child, awaits its exit, publishes the
//!   exit code to the [`ProcessHandle`] and, once output has drained, posts an
//!   [`ExitEvent`]
//!
//! The exit is published the moment the child is reaped. From then on the
//! pid may be reused, so the handle refuses to signal it.
//!
//! The command string is tokenized with shell-word rules and executed
//! directly; it is never handed to a shell.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::log_sink::{LogSink, LogStream};
use crate::project::tokenize_command;

/// How long the watcher waits for output readers after the child exits.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("project root does not exist: {}", .0.display())]
    RootMissing(PathBuf),

    #[error("invalid run command: {0}")]
    InvalidCommand(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit observation for one child. `code` is `None` when the exit status
/// could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// Posted by the watcher task when a child exits, for whatever reason.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub project_id: String,
    pub generation: u64,
    pub exit_code: Option<i32>,
    pub ran_for: Duration,
}

/// Opaque reference to one live child.
///
/// Not `Clone`: exactly one owner may signal the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    generation: u64,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// The exit observation, once the watcher has seen the child go.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Ask the process group to terminate (SIGTERM).
    pub fn signal_terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    /// Force-terminate the process group (SIGKILL).
    pub fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    /// Suspend the caller until the child has exited.
    pub async fn wait_exit(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            // Watcher dropped without publishing.
            Err(_) => None,
        };
        exit.unwrap_or(ProcessExit { code: None })
    }

    fn signal(&self, signal: libc::c_int) {
        if !self.is_alive() {
            return;
        }
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        // SAFETY: plain syscalls on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::killpg(pid, signal) };
        if rc != 0 {
            // Group gone or never created; fall back to the leader alone.
            // SAFETY: as above.
            let _ = unsafe { libc::kill(pid, signal) };
        }
    }
}

/// Spawns project children and reports their exits on one channel.
#[derive(Clone)]
pub struct ProcessRunner {
    logs: Arc<LogSink>,
    events: mpsc::UnboundedSender<ExitEvent>,
}

impl ProcessRunner {
    pub fn new(logs: Arc<LogSink>, events: mpsc::UnboundedSender<ExitEvent>) -> Self {
        Self { logs, events }
    }

    /// Start `command` in `root` for `project_id`.
    ///
    /// `generation` is echoed back in the [`ExitEvent`] so stale exits of a
    /// previous child can be told apart from the current one.
    pub fn spawn(
        &self,
        project_id: &str,
        root: &Path,
        command: &str,
        generation: u64,
    ) -> Result<ProcessHandle, SpawnError> {
        if !root.is_dir() {
            return Err(SpawnError::RootMissing(root.to_path_buf()));
        }
        let argv = tokenize_command(command).map_err(SpawnError::InvalidCommand)?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| spawn_error(&argv[0], e))?;

        let pid = child.id().ok_or_else(|| {
            SpawnError::Io(std::io::Error::other("child exited before pid read"))
        })?;
        let started_at = Instant::now();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(
                Arc::clone(&self.logs),
                project_id.to_string(),
                LogStream::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(
                Arc::clone(&self.logs),
                project_id.to_string(),
                LogStream::Stderr,
                stderr,
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let events = self.events.clone();
        let id = project_id.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => Some(exit_code(status)),
                Err(e) => {
                    tracing::warn!("Failed to read exit status of {id} (pid {pid}): {e}");
                    None
                }
            };
            let _ = exit_tx.send(Some(ProcessExit { code }));
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }
            let _ = events.send(ExitEvent {
                project_id: id,
                generation,
                exit_code: code,
                ran_for: started_at.elapsed(),
            });
        });

        tracing::debug!("Spawned {project_id} as pid {pid}: {argv:?}");
        Ok(ProcessHandle {
            pid,
            generation,
            started_at,
            started_wall: Utc::now(),
            exit_rx,
        })
    }
}

/// Outcome of a command run to completion by [`run_captured`].
#[derive(Debug, Clone)]
pub struct CapturedRun {
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub timed_out: bool,
}

/// Run `command` in `root` to completion, teeing every output line into the
/// log sink under `stream` and collecting it for the caller.
///
/// The child is killed if it outlives `timeout`.
pub async fn run_captured(
    logs: &LogSink,
    project_id: &str,
    root: &Path,
    command: &str,
    stream: LogStream,
    timeout: Duration,
) -> Result<CapturedRun, SpawnError> {
    if !root.is_dir() {
        return Err(SpawnError::RootMissing(root.to_path_buf()));
    }
    let argv = tokenize_command(command).map_err(SpawnError::InvalidCommand)?;

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(&argv[0], e))?;

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(collect_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(collect_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut output = Vec::new();
    let wait = async {
        let status = child.wait().await;
        while let Some(line) = line_rx.recv().await {
            logs.append(project_id, stream, line.clone());
            output.push(line);
        }
        status
    };

    let waited = tokio::time::timeout(timeout, wait).await;
    let (exit_code, timed_out) = match waited {
        Ok(Ok(status)) => (Some(exit_code(status)), false),
        Ok(Err(e)) => return Err(SpawnError::Io(e)),
        Err(_) => {
            let _ = child.kill().await;
            (None, true)
        }
    };
    for reader in readers {
        reader.abort();
    }

    Ok(CapturedRun {
        exit_code,
        output,
        timed_out,
    })
}

fn spawn_error(program: &str, e: std::io::Error) -> SpawnError {
    match e.kind() {
        std::io::ErrorKind::NotFound => SpawnError::CommandNotFound(program.to_string()),
        std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_string()),
        _ => SpawnError::Io(e),
    }
}

/// Exit code, or `128 + signal` for signal-terminated children.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

fn forward_lines<R>(
    logs: Arc<LogSink>,
    project_id: String,
    stream: LogStream,
    reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => logs.append(&project_id, stream, decode_line(&buf)),
                Err(e) => {
                    tracing::debug!("Output reader for {project_id} stopped: {e}");
                    break;
                }
            }
        }
    })
}

fn collect_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
            if n == 0 || tx.send(decode_line(&buf)).is_err() {
                break;
            }
            buf.clear();
        }
    })
}

fn decode_line(buf: &[u8]) -> String {
    let line = String::from_utf8_lossy(buf);
    line.trim_end_matches(['\n', '\r']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn runner(dir: &Path) -> (ProcessRunner, Arc<LogSink>, mpsc::UnboundedReceiver<ExitEvent>) {
        let logs = Arc::new(LogSink::new(dir.join("logs"), 100));
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessRunner::new(Arc::clone(&logs), tx), logs, rx)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_and_reports_exit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runner, logs, mut events) = runner(tmp.path());

        let handle = runner
            .spawn("bot", tmp.path(), "sh -c 'echo out; echo err >&2; exit 3'", 7)
            .unwrap();
        let exit = handle.wait_exit().await;
        assert_eq!(exit.code, Some(3));
        assert!(!handle.is_alive());

        let event = events.recv().await.unwrap();
        assert_eq!(event.project_id, "bot");
        assert_eq!(event.generation, 7);
        assert_eq!(event.exit_code, Some(3));

        let tail = logs.tail("bot", 10);
        assert!(tail.iter().any(|e| e.stream == LogStream::Stdout && e.line == "out"));
        assert!(tail.iter().any(|e| e.stream == LogStream::Stderr && e.line == "err"));
    }

    #[tokio::test]
    async fn runs_in_project_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("marker.txt"), "here").unwrap();
        let (runner, logs, _events) = runner(tmp.path());

        let handle = runner.spawn("bot", &root, "cat marker.txt", 0).unwrap();
        assert_eq!(handle.wait_exit().await.code, Some(0));
        assert_eq!(logs.tail("bot", 1)[0].line, "here");
    }

    #[tokio::test]
    async fn output_is_streamed_while_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runner, logs, _events) = runner(tmp.path());

        let handle = runner
            .spawn("bot", tmp.path(), "sh -c 'echo ready; sleep 30'", 0)
            .unwrap();
        let mut seen = false;
        for _ in 0..100 {
            if logs.tail("bot", 10).iter().any(|e| e.line == "ready") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "line should be visible before exit");
        assert!(handle.is_alive());

        handle.kill();
        assert_eq!(handle.wait_exit().await.code, Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn terminate_reaches_the_process() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runner, _logs, _events) = runner(tmp.path());

        let handle = runner.spawn("bot", tmp.path(), "sleep 30", 0).unwrap();
        handle.signal_terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(exit.code, Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn exit_is_published_before_inherited_pipes_close() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runner, _logs, mut events) = runner(tmp.path());

        // The background sleep keeps stdout open after the shell is reaped.
        let handle = runner
            .spawn("bot", tmp.path(), "sh -c 'sleep 2 & exit 0'", 1)
            .unwrap();
        let reaped = tokio::time::timeout(Duration::from_millis(400), handle.wait_exit())
            .await
            .unwrap();
        assert_eq!(reaped.code, Some(0));
        assert!(!handle.is_alive());

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation, 1);
    }

    #[tokio::test]
    async fn spawn_errors_are_typed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runner, _logs, _events) = runner(tmp.path());

        let missing_root = runner.spawn("bot", &tmp.path().join("nope"), "sleep 1", 0);
        assert!(matches!(missing_root, Err(SpawnError::RootMissing(_))));

        let missing_cmd = runner.spawn("bot", tmp.path(), "nonexistent_command_xyz_12345", 0);
        assert!(matches!(
            missing_cmd,
            Err(SpawnError::CommandNotFound(c)) if c == "nonexistent_command_xyz_12345"
        ));

        let empty = runner.spawn("bot", tmp.path(), "  ", 0);
        assert!(matches!(empty, Err(SpawnError::InvalidCommand(_))));
    }

    #[tokio::test]
    async fn captured_run_collects_output_and_times_out() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = LogSink::new(tmp.path().join("logs"), 100);

        let run = run_captured(
            &logs,
            "bot",
            tmp.path(),
            "sh -c 'echo one; echo two >&2; exit 1'",
            LogStream::Install,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(run.exit_code, Some(1));
        assert!(!run.timed_out);
        assert!(run.output.contains(&"one".to_string()));
        assert!(run.output.contains(&"two".to_string()));
        assert!(logs.tail("bot", 10).iter().all(|e| e.stream == LogStream::Install));

        let slow = run_captured(
            &logs,
            "bot",
            tmp.path(),
            "sleep 10",
            LogStream::Install,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(slow.timed_out);
        assert_eq!(slow.exit_code, None);
    }
}
