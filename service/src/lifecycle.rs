//! Per-project lifecycle state machine.
//!
//! ```text
//! Stopped ──start()──► Starting ──grace elapsed──► Running ──stop()──► Stopping
//!    ▲                    │                          │                    │
//!    │              exit in grace             unexpected exit             │
//!    │                    ▼                          │                    │
//!    ├───── stop() ──── Crashed ◄────────────────────┘                    │
//!    │                    └── start() / restart() ──► Starting            │
//!    └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Lifecycle`] owns at most one [`ProcessHandle`]. Callers serialize
//! access (the registry keeps each one behind an async mutex); readers that
//! must never block use the published [`LifecycleRecord`] snapshot instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, SupervisorError};
use crate::log_sink::{LogSink, LogStream};
use crate::project::Project;
use crate::restart::CrashReport;
use crate::runner::{ExitEvent, ProcessHandle, ProcessRunner};

/// Upper bound on waiting for the kernel to reap a SIGKILLed child.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl LifecycleState {
    /// A child process exists in this state.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        })
    }
}

/// Point-in-time view of one project's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub project_id: String,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

impl LifecycleRecord {
    fn stopped(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            state: LifecycleState::Stopped,
            pid: None,
            last_exit_code: None,
            last_started_at: None,
            restart_count: 0,
        }
    }
}

impl std::fmt::Display for LifecycleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.state, self.pid) {
            (LifecycleState::Running, Some(pid)) => write!(f, "Running (PID: {pid})")?,
            (LifecycleState::Crashed, _) => match self.last_exit_code {
                Some(code) => write!(f, "Crashed (exit code {code})")?,
                None => f.write_str("Crashed")?,
            },
            (state, _) => {
                let name = state.to_string();
                let mut chars = name.chars();
                if let Some(first) = chars.next() {
                    write!(f, "{}{}", first.to_ascii_uppercase(), chars.as_str())?;
                }
            }
        }
        if self.restart_count > 0 {
            write!(f, ", restarts: {}", self.restart_count)?;
        }
        Ok(())
    }
}

/// Who asked for a start; decides what happens to the restart count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// Operator `start`/`restart`: the consecutive count starts over.
    Operator,
    /// Issued by the auto-restart policy as its `attempt`-th try.
    AutoRestart { attempt: u32 },
}

/// Collaborators and timings shared by every project's state machine.
pub struct LifecycleContext {
    runner: ProcessRunner,
    logs: Arc<LogSink>,
    start_grace: Duration,
    stop_timeout: Duration,
    generations: AtomicU64,
}

impl LifecycleContext {
    pub fn new(
        runner: ProcessRunner,
        logs: Arc<LogSink>,
        start_grace: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            logs,
            start_grace,
            stop_timeout,
            generations: AtomicU64::new(1),
        }
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.logs
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Lifecycle {
    ctx: Arc<LifecycleContext>,
    record: LifecycleRecord,
    handle: Option<ProcessHandle>,
    published: watch::Sender<LifecycleRecord>,
}

impl Lifecycle {
    /// A fresh machine in `Stopped`.
    pub fn new(ctx: Arc<LifecycleContext>, project_id: &str) -> Self {
        let record = LifecycleRecord::stopped(project_id);
        let (published, _) = watch::channel(record.clone());
        Self {
            ctx,
            record,
            handle: None,
            published,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.record.state
    }

    pub fn restart_count(&self) -> u32 {
        self.record.restart_count
    }

    pub fn record(&self) -> LifecycleRecord {
        self.record.clone()
    }

    /// The live child, if any.
    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Receiver that always holds the latest published record.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleRecord> {
        self.published.subscribe()
    }

    /// Spawn the project's run command and wait out the grace period.
    ///
    /// On spawn failure the previous state is kept. A child that exits
    /// within the grace period leaves the machine `Crashed`.
    pub async fn start(
        &mut self,
        project: &Project,
        trigger: StartTrigger,
    ) -> Result<LifecycleRecord> {
        let previous = self.record.state;
        if !matches!(previous, LifecycleState::Stopped | LifecycleState::Crashed) {
            return Err(SupervisorError::AlreadyRunning {
                id: project.id.clone(),
                state: previous,
            });
        }

        self.record.restart_count = match trigger {
            StartTrigger::Operator => 0,
            StartTrigger::AutoRestart { attempt } => attempt,
        };
        self.transition(
            LifecycleState::Starting,
            &format!("starting: {}", project.run_command),
        );

        let generation = self.ctx.next_generation();
        let handle = match self.ctx.runner.spawn(
            &project.id,
            &project.root,
            &project.run_command,
            generation,
        ) {
            Ok(handle) => handle,
            Err(source) => {
                self.transition(previous, &format!("start failed: {source}"));
                return Err(SupervisorError::Spawn {
                    id: project.id.clone(),
                    source,
                });
            }
        };

        self.record.pid = Some(handle.pid());
        self.record.last_started_at = Some(handle.started_wall());
        self.publish();

        let grace = self.ctx.start_grace;
        match tokio::time::timeout(grace, handle.wait_exit()).await {
            Ok(exit) => {
                self.record.pid = None;
                self.record.last_exit_code = exit.code;
                self.transition(
                    LifecycleState::Crashed,
                    &format!("exited during startup with code {}", fmt_code(exit.code)),
                );
                Err(SupervisorError::StartupFailed {
                    id: project.id.clone(),
                    exit_code: exit.code,
                })
            }
            Err(_) => {
                let pid = handle.pid();
                self.handle = Some(handle);
                self.transition(LifecycleState::Running, &format!("running as pid {pid}"));
                Ok(self.record())
            }
        }
    }

    /// Terminate the child: SIGTERM, up to `stop_timeout`, then SIGKILL.
    ///
    /// `Crashed` is acknowledged as `Stopped`; `Stopped` is an error.
    pub async fn stop(&mut self) -> Result<LifecycleRecord> {
        let id = self.record.project_id.clone();
        match self.record.state {
            LifecycleState::Stopped => return Err(SupervisorError::NotRunning(id)),
            LifecycleState::Crashed => {
                self.transition(LifecycleState::Stopped, "crash acknowledged");
                return Ok(self.record());
            }
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping => {}
        }
        let Some(handle) = self.handle.take() else {
            self.record.pid = None;
            self.transition(LifecycleState::Stopped, "stopped (no process)");
            return Ok(self.record());
        };

        self.transition(LifecycleState::Stopping, "sending SIGTERM");
        handle.signal_terminate();

        let exit = match tokio::time::timeout(self.ctx.stop_timeout, handle.wait_exit()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(
                    "{id}: pid {} ignored SIGTERM for {:?}, killing",
                    handle.pid(),
                    self.ctx.stop_timeout
                );
                self.note("stop timeout elapsed, sending SIGKILL");
                handle.kill();
                match tokio::time::timeout(REAP_TIMEOUT, handle.wait_exit()).await {
                    Ok(exit) => exit,
                    Err(_) => {
                        self.handle = Some(handle);
                        return Err(SupervisorError::Timeout {
                            id,
                            operation: "stop".to_string(),
                        });
                    }
                }
            }
        };

        self.record.pid = None;
        self.record.last_exit_code = exit.code;
        self.transition(
            LifecycleState::Stopped,
            &format!("stopped with code {}", fmt_code(exit.code)),
        );
        Ok(self.record())
    }

    /// `stop()` when live, then `start()`. Restarting a crashed or stopped
    /// project is just a start.
    pub async fn restart(&mut self, project: &Project) -> Result<LifecycleRecord> {
        if self.record.state.is_live() {
            self.stop().await?;
        }
        self.start(project, StartTrigger::Operator).await
    }

    /// Apply an exit observed by the runner's watcher.
    ///
    /// Returns a [`CrashReport`] only for an unexpected exit of the current
    /// `Running` child. Exits of older generations are ignored.
    pub fn on_exit(&mut self, event: &ExitEvent) -> Option<CrashReport> {
        let current = self.handle.as_ref().map(ProcessHandle::generation);
        if current != Some(event.generation) {
            tracing::debug!(
                "{}: ignoring exit of stale generation {}",
                event.project_id,
                event.generation
            );
            return None;
        }

        self.handle = None;
        self.record.pid = None;
        self.record.last_exit_code = event.exit_code;
        match self.record.state {
            LifecycleState::Running => {
                let note = match event.exit_code {
                    Some(code) => format!("exited unexpectedly with code {code}"),
                    None => "exit status unreadable, marking crashed".to_string(),
                };
                self.transition(LifecycleState::Crashed, &note);
                Some(CrashReport {
                    exit_code: event.exit_code,
                    ran_for: event.ran_for,
                })
            }
            LifecycleState::Stopping => {
                self.transition(LifecycleState::Stopped, "stopped");
                None
            }
            state => {
                tracing::warn!("{}: exit event while {state}", event.project_id);
                self.transition(LifecycleState::Crashed, "exited");
                None
            }
        }
    }

    fn transition(&mut self, to: LifecycleState, note: &str) {
        let from = self.record.state;
        self.record.state = to;
        tracing::info!("{}: {from} -> {to} ({note})", self.record.project_id);
        self.ctx.logs.append(
            &self.record.project_id,
            LogStream::Supervisor,
            format!("{from} -> {to}: {note}"),
        );
        self.publish();
    }

    fn note(&self, note: &str) {
        self.ctx
            .logs
            .append(&self.record.project_id, LogStream::Supervisor, note);
    }

    fn publish(&self) {
        self.published.send_replace(self.record.clone());
    }
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        project: Project,
        ctx: Arc<LifecycleContext>,
        events: mpsc::UnboundedReceiver<ExitEvent>,
    }

    fn fixture(command: &str, grace_ms: u64, stop_ms: u64) -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = Arc::new(LogSink::new(tmp.path().join("logs"), 100));
        let (tx, events) = mpsc::unbounded_channel();
        let runner = ProcessRunner::new(Arc::clone(&logs), tx);
        let ctx = Arc::new(LifecycleContext::new(
            runner,
            logs,
            Duration::from_millis(grace_ms),
            Duration::from_millis(stop_ms),
        ));
        let project = Project::new("bot", tmp.path(), command);
        Fixture {
            _tmp: tmp,
            project,
            ctx,
            events,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop() {
        let fx = fixture("sleep 30", 200, 2_000);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");
        assert_eq!(lc.state(), LifecycleState::Stopped);

        let rec = lc.start(&fx.project, StartTrigger::Operator).await.unwrap();
        assert_eq!(rec.state, LifecycleState::Running);
        assert!(rec.pid.is_some());

        let err = lc.start(&fx.project, StartTrigger::Operator).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));
        assert_eq!(lc.state(), LifecycleState::Running);

        let rec = lc.stop().await.unwrap();
        assert_eq!(rec.state, LifecycleState::Stopped);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.last_exit_code, Some(128 + libc::SIGTERM));

        assert!(matches!(lc.stop().await, Err(SupervisorError::NotRunning(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_during_grace_is_startup_failure() {
        let fx = fixture("sh -c 'exit 4'", 1_000, 1_000);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");

        let err = lc.start(&fx.project, StartTrigger::Operator).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::StartupFailed {
                exit_code: Some(4),
                ..
            }
        ));
        assert_eq!(lc.state(), LifecycleState::Crashed);
        assert_eq!(lc.record().last_exit_code, Some(4));

        // Acknowledging the crash.
        assert_eq!(lc.stop().await.unwrap().state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_keeps_previous_state() {
        let fx = fixture("nonexistent_command_xyz_12345", 100, 100);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");

        let err = lc.start(&fx.project, StartTrigger::Operator).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(lc.state(), LifecycleState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_escalates_to_kill_when_term_is_ignored() {
        let fx = fixture("sh -c 'trap \"\" TERM; while :; do sleep 1; done'", 200, 300);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");
        lc.start(&fx.project, StartTrigger::Operator).await.unwrap();

        let started = std::time::Instant::now();
        let rec = lc.stop().await.unwrap();
        assert_eq!(rec.state, LifecycleState::Stopped);
        assert_eq!(rec.last_exit_code, Some(128 + libc::SIGKILL));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexpected_exit_reports_crash_once() {
        let mut fx = fixture("sh -c 'sleep 0.4; exit 9'", 100, 1_000);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");
        lc.start(&fx.project, StartTrigger::Operator).await.unwrap();

        let event = fx.events.recv().await.unwrap();
        let crash = lc.on_exit(&event).unwrap();
        assert_eq!(crash.exit_code, Some(9));
        assert_eq!(lc.state(), LifecycleState::Crashed);

        // Same event again is stale.
        assert_eq!(lc.on_exit(&event), None);
        assert_eq!(lc.state(), LifecycleState::Crashed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_replaces_the_child_and_resets_count() {
        let fx = fixture("sleep 30", 100, 2_000);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");
        let first = lc
            .start(&fx.project, StartTrigger::AutoRestart { attempt: 3 })
            .await
            .unwrap();
        assert_eq!(first.restart_count, 3);

        let second = lc.restart(&fx.project).await.unwrap();
        assert_eq!(second.state, LifecycleState::Running);
        assert_ne!(second.pid, first.pid);
        assert_eq!(second.restart_count, 0);
        lc.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transitions_are_published_and_logged() {
        let fx = fixture("sleep 30", 100, 2_000);
        let mut lc = Lifecycle::new(Arc::clone(&fx.ctx), "bot");
        let rx = lc.subscribe();

        lc.start(&fx.project, StartTrigger::Operator).await.unwrap();
        assert_eq!(rx.borrow().state, LifecycleState::Running);
        lc.stop().await.unwrap();
        assert_eq!(rx.borrow().state, LifecycleState::Stopped);

        let lines: Vec<String> = fx
            .ctx
            .logs()
            .tail("bot", 100)
            .into_iter()
            .filter(|e| e.stream == LogStream::Supervisor)
            .map(|e| e.line)
            .collect();
        assert!(lines.iter().any(|l| l.starts_with("stopped -> starting")));
        assert!(lines.iter().any(|l| l.starts_with("starting -> running")));
        assert!(lines.iter().any(|l| l.starts_with("stopping -> stopped")));
    }

    #[test]
    fn record_display() {
        let mut rec = LifecycleRecord::stopped("bot");
        assert_eq!(rec.to_string(), "Stopped");
        rec.state = LifecycleState::Running;
        rec.pid = Some(42);
        assert_eq!(rec.to_string(), "Running (PID: 42)");
        rec.state = LifecycleState::Crashed;
        rec.pid = None;
        rec.last_exit_code = Some(1);
        rec.restart_count = 2;
        assert_eq!(rec.to_string(), "Crashed (exit code 1), restarts: 2");
    }
}
