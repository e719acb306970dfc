//! Supervisor registry: project id → lifecycle, configuration and handles.
//!
//! The [`Supervisor`] is the façade every caller talks to. Each project is an
//! [`Arc<ProjectEntry>`] in a `RwLock<BTreeMap>`; the map lock is only held
//! long enough to look up, insert or remove an entry. Control operations on
//! one project are serialized by that entry's async mutex, so different
//! projects never wait on each other.
//!
//! Unexpected exits arrive from the runner's watcher tasks as [`ExitEvent`]s
//! on one channel. A dispatcher task applies them to the owning entry and,
//! when the [`RestartPolicy`] says so, schedules a delayed restart.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc, watch};
use tokio::task::JoinSet;

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::lifecycle::{Lifecycle, LifecycleContext, LifecycleRecord, LifecycleState, StartTrigger};
use crate::log_sink::{LogEntry, LogSink, LogStream};
use crate::persistence::{PersistenceStore, ProjectMeta};
use crate::project::{Project, tokenize_command, validate_id};
use crate::protocol::{InstallResult, ProjectInfo, ServiceStatusResult, count_live};
use crate::restart::{GiveUpReason, RestartDecision, RestartPolicy};
use crate::runner::{ExitEvent, ProcessRunner, run_captured};
use crate::sampler::{ResourceSampler, UsageSample};

/// Output lines quoted in a failed install's error message.
const INSTALL_ERROR_TAIL: usize = 10;

/// One supervised project.
pub struct ProjectEntry {
    project: StdMutex<Project>,
    control: Mutex<Lifecycle>,
    status: watch::Receiver<LifecycleRecord>,
    install: Mutex<()>,
    /// Set by `remove` under the control lock. Callers that looked the entry
    /// up before the removal must not act on it afterwards.
    removed: AtomicBool,
}

impl ProjectEntry {
    fn new(ctx: &Arc<LifecycleContext>, project: Project) -> Self {
        let lifecycle = Lifecycle::new(Arc::clone(ctx), &project.id);
        let status = lifecycle.subscribe();
        Self {
            project: StdMutex::new(project),
            control: Mutex::new(lifecycle),
            status,
            install: Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    /// Take the control lock, failing with `NotFound` if the project was
    /// removed while this caller waited for it.
    async fn lock(&self, id: &str) -> Result<MutexGuard<'_, Lifecycle>> {
        let lifecycle = self.control.lock().await;
        self.ensure_registered(id)?;
        Ok(lifecycle)
    }

    fn ensure_registered(&self, id: &str) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn project(&self) -> Project {
        self.project
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot(&self) -> LifecycleRecord {
        self.status.borrow().clone()
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    projects: RwLock<BTreeMap<String, Arc<ProjectEntry>>>,
    ctx: Arc<LifecycleContext>,
    logs: Arc<LogSink>,
    sampler: ResourceSampler,
    policy: RestartPolicy,
    store: PersistenceStore,
    /// Serializes `projects.json` rewrites.
    persist_lock: Mutex<()>,
    shutting_down: AtomicBool,
    started_at: Instant,
}

/// Handle to the supervisor. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Build the registry from `projects.json`, every project `Stopped`.
    ///
    /// Must be called from within a tokio runtime: the exit dispatcher is
    /// spawned here.
    pub fn load(config: SupervisorConfig) -> Result<Self> {
        let store = PersistenceStore::with_base_dir(config.projects_dir.clone())?;
        let persisted = store.load()?;

        let logs = Arc::new(LogSink::new(config.logs_dir.clone(), config.max_log_lines));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = ProcessRunner::new(Arc::clone(&logs), events_tx);
        let ctx = Arc::new(LifecycleContext::new(
            runner,
            Arc::clone(&logs),
            config.start_grace,
            config.stop_timeout,
        ));

        let mut projects = BTreeMap::new();
        for (key, meta) in persisted {
            if let Err(e) = validate_id(&meta.id) {
                tracing::warn!("Skipping persisted project {key:?}: {e}");
                continue;
            }
            if let Some(pid) = meta.last_pid
                && pid_alive(pid)
            {
                tracing::warn!(
                    "Project {} was running as pid {pid} before restart and that pid is \
                     still alive; it is not managed by this supervisor",
                    meta.id
                );
                logs.append(
                    &meta.id,
                    LogStream::Supervisor,
                    format!("previous process (pid {pid}) still alive, not adopted"),
                );
            }
            let project = meta.into_project();
            projects.insert(project.id.clone(), Arc::new(ProjectEntry::new(&ctx, project)));
        }
        tracing::info!(
            "Loaded {} project(s) from {}",
            projects.len(),
            store.metadata_path().display()
        );

        // Nothing is running yet: rewrite without the stale pids.
        let metas: BTreeMap<String, ProjectMeta> = projects
            .iter()
            .map(|(id, entry)| (id.clone(), ProjectMeta::from_project(&entry.project(), None)))
            .collect();
        store.save(&metas)?;

        let inner = Arc::new(SupervisorInner {
            policy: RestartPolicy::from_config(&config.restart, config.start_grace),
            sampler: ResourceSampler::new(config.sample_interval),
            config,
            projects: RwLock::new(projects),
            ctx,
            logs,
            store,
            persist_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
        });
        tokio::spawn(dispatch_exits(Arc::downgrade(&inner), events_rx));
        Ok(Self { inner })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn uptime_s(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Register an existing directory as a project.
    pub async fn register(
        &self,
        id: &str,
        root: impl Into<PathBuf>,
        command: &str,
    ) -> Result<LifecycleRecord> {
        check_id(id)?;
        tokenize_command(command).map_err(SupervisorError::InvalidCommand)?;

        let project = Project::new(id, root, command);
        let record = {
            let mut projects = self.inner.projects.write().await;
            if projects.contains_key(id) {
                return Err(SupervisorError::DuplicateProject(id.to_string()));
            }
            let entry = Arc::new(ProjectEntry::new(&self.inner.ctx, project));
            let record = entry.snapshot();
            projects.insert(id.to_string(), entry);
            record
        };
        self.persist().await?;
        tracing::info!("Registered project {id}");
        Ok(record)
    }

    /// Create `<projects_dir>/<id>` and register it with the default command.
    pub async fn create_project(&self, id: &str) -> Result<LifecycleRecord> {
        check_id(id)?;
        if self.inner.projects.read().await.contains_key(id) {
            return Err(SupervisorError::DuplicateProject(id.to_string()));
        }
        let root = self.inner.config.projects_dir.join(id);
        std::fs::create_dir_all(&root).map_err(crate::persistence::PersistenceError::from)?;
        let command = self.inner.config.default_command.clone();
        self.register(id, root, &command).await
    }

    /// Unregister a stopped or crashed project and drop its logs. The
    /// project directory is left on disk.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        let lifecycle = entry.lock(id).await?;
        let state = lifecycle.state();
        if state.is_live() {
            return Err(SupervisorError::AlreadyRunning {
                id: id.to_string(),
                state,
            });
        }
        entry.removed.store(true, Ordering::SeqCst);
        self.inner.projects.write().await.remove(id);
        drop(lifecycle);

        self.inner.logs.clear(id);
        self.persist().await?;
        tracing::info!("Removed project {id}");
        Ok(())
    }

    /// Change the run command. Takes effect on the next start.
    pub async fn update_command(&self, id: &str, command: &str) -> Result<ProjectInfo> {
        tokenize_command(command).map_err(SupervisorError::InvalidCommand)?;
        let entry = self.entry(id).await?;
        {
            let _lifecycle = entry.lock(id).await?;
            entry
                .project
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .run_command = command.to_string();
        }
        self.inner.logs.append(
            id,
            LogStream::Supervisor,
            format!("run command set to: {command}"),
        );
        self.persist().await?;
        Ok(project_info(&entry))
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Registered ids in ascending order.
    pub async fn list(&self) -> Vec<String> {
        self.inner.projects.read().await.keys().cloned().collect()
    }

    /// Every project with its current snapshot, ordered by id.
    pub async fn list_info(&self) -> Vec<ProjectInfo> {
        let projects = self.inner.projects.read().await;
        projects.values().map(project_info).collect()
    }

    /// The current lifecycle snapshot. Never waits on a control operation.
    pub async fn get(&self, id: &str) -> Result<LifecycleRecord> {
        Ok(self.entry(id).await?.snapshot())
    }

    /// Alias of [`Supervisor::get`].
    pub async fn status(&self, id: &str) -> Result<LifecycleRecord> {
        self.get(id).await
    }

    pub async fn info(&self, id: &str) -> Result<ProjectInfo> {
        Ok(project_info(&self.entry(id).await?))
    }

    /// Retained output history, oldest first. `None` means the whole window.
    pub async fn logs(&self, id: &str, max_lines: Option<usize>) -> Result<Vec<LogEntry>> {
        self.entry(id).await?;
        let n = max_lines.unwrap_or(self.inner.logs.max_lines());
        Ok(self.inner.logs.tail(id, n))
    }

    /// Sample CPU, memory and uptime of the live child.
    pub async fn usage(&self, id: &str) -> Result<UsageSample> {
        let entry = self.entry(id).await?;
        let lifecycle = entry.lock(id).await?;
        let Some(handle) = lifecycle.handle() else {
            return Err(SupervisorError::ProcessGone(id.to_string()));
        };
        self.inner
            .sampler
            .sample(handle)
            .await
            .map_err(|_| SupervisorError::ProcessGone(id.to_string()))
    }

    pub async fn service_status(&self) -> ServiceStatusResult {
        let records: Vec<LifecycleRecord> = {
            let projects = self.inner.projects.read().await;
            projects.values().map(|e| e.snapshot()).collect()
        };
        ServiceStatusResult {
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_s: self.uptime_s(),
            projects: records.len(),
            running: count_live(&records),
        }
    }

    // ── Lifecycle control ────────────────────────────────────────────────

    pub async fn start(&self, id: &str) -> Result<LifecycleRecord> {
        let entry = self.entry(id).await?;
        let result = {
            let mut lifecycle = entry.lock(id).await?;
            lifecycle
                .start(&entry.project(), StartTrigger::Operator)
                .await
        };
        self.persist_logged().await;
        result
    }

    pub async fn stop(&self, id: &str) -> Result<LifecycleRecord> {
        let entry = self.entry(id).await?;
        let result = entry.lock(id).await?.stop().await;
        self.persist_logged().await;
        result
    }

    pub async fn restart(&self, id: &str) -> Result<LifecycleRecord> {
        let entry = self.entry(id).await?;
        let result = {
            let mut lifecycle = entry.lock(id).await?;
            lifecycle.restart(&entry.project()).await
        };
        self.persist_logged().await;
        result
    }

    /// Run the install command in the project root, teeing its output into
    /// the project's log as `install` entries.
    pub async fn install_dependencies(&self, id: &str) -> Result<InstallResult> {
        let entry = self.entry(id).await?;
        let _installing = entry.install.lock().await;
        entry.ensure_registered(id)?;
        let project = entry.project();
        let install = &self.inner.config.install;

        if !project.root.join(&install.manifest).is_file() {
            return Err(SupervisorError::DependencyInstall {
                id: id.to_string(),
                reason: format!("{} not found", install.manifest),
            });
        }

        self.inner.logs.append(
            id,
            LogStream::Supervisor,
            format!("installing dependencies: {}", install.command),
        );
        tracing::info!("Installing dependencies for {id}");
        let run = run_captured(
            &self.inner.logs,
            id,
            &project.root,
            &install.command,
            LogStream::Install,
            install.timeout,
        )
        .await
        .map_err(|e| SupervisorError::DependencyInstall {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        if run.timed_out {
            self.inner.logs.append(
                id,
                LogStream::Supervisor,
                format!("dependency install timed out after {:?}", install.timeout),
            );
            return Err(SupervisorError::Timeout {
                id: id.to_string(),
                operation: "dependency install".to_string(),
            });
        }
        if run.exit_code != Some(0) {
            let code = run
                .exit_code
                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
            let tail_start = run.output.len().saturating_sub(INSTALL_ERROR_TAIL);
            let mut reason = format!("exit code {code}");
            for line in &run.output[tail_start..] {
                reason.push('\n');
                reason.push_str(line);
            }
            return Err(SupervisorError::DependencyInstall {
                id: id.to_string(),
                reason,
            });
        }

        self.inner
            .logs
            .append(id, LogStream::Supervisor, "dependencies installed");
        Ok(InstallResult {
            id: id.to_string(),
            exit_code: run.exit_code,
            output: run.output,
        })
    }

    /// Stop every live project in parallel and cancel pending
    /// auto-restarts. Crashed and stopped projects are left as they are.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<(String, Arc<ProjectEntry>)> = {
            let projects = self.inner.projects.read().await;
            projects
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut stops = JoinSet::new();
        for (id, entry) in entries {
            stops.spawn(async move {
                let mut lifecycle = entry.control.lock().await;
                if lifecycle.state().is_live() {
                    let result = lifecycle.stop().await;
                    (id, Some(result))
                } else {
                    (id, None)
                }
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, Some(Err(e)))) => tracing::warn!("Failed to stop {id} on shutdown: {e}"),
                Ok((id, Some(Ok(_)))) => tracing::info!("Stopped {id}"),
                Ok((_, None)) => {}
                Err(e) => tracing::warn!("Stop task failed: {e}"),
            }
        }
        self.persist_logged().await;
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn entry(&self, id: &str) -> Result<Arc<ProjectEntry>> {
        self.inner
            .projects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Rewrite `projects.json` from the current entries and snapshots.
    async fn persist(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;
        let metas: BTreeMap<String, ProjectMeta> = {
            let projects = self.inner.projects.read().await;
            projects
                .iter()
                .map(|(id, entry)| {
                    let meta = ProjectMeta::from_project(&entry.project(), entry.snapshot().pid);
                    (id.clone(), meta)
                })
                .collect()
        };
        self.inner.store.save(&metas)?;
        Ok(())
    }

    /// Persist after a lifecycle change. The change already happened, so a
    /// write failure is reported but does not fail the operation.
    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist project metadata: {e}");
        }
    }

    /// Apply one exit event; schedule an auto-restart when the policy asks.
    async fn handle_exit(&self, event: ExitEvent) {
        let Ok(entry) = self.entry(&event.project_id).await else {
            tracing::debug!("Exit event for removed project {}", event.project_id);
            return;
        };
        let (crash, restart_count) = {
            let Ok(mut lifecycle) = entry.lock(&event.project_id).await else {
                return;
            };
            (lifecycle.on_exit(&event), lifecycle.restart_count())
        };
        let Some(crash) = crash else {
            return;
        };
        self.persist_logged().await;

        let id = event.project_id;
        match self.inner.policy.decide(&crash, restart_count) {
            RestartDecision::Restart { delay, attempt } => {
                tracing::info!("{id}: auto-restart {attempt} in {delay:?}");
                self.inner.logs.append(
                    &id,
                    LogStream::Supervisor,
                    format!("auto-restart attempt {attempt} in {}s", delay.as_secs_f32()),
                );
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        Supervisor { inner }.auto_restart(&id, attempt).await;
                    }
                });
            }
            RestartDecision::GiveUp(reason) => {
                let note = match reason {
                    GiveUpReason::Disabled => "auto-restart disabled".to_string(),
                    GiveUpReason::StartupFailure => format!(
                        "crashed after {:.1}s, within min uptime; not restarting",
                        crash.ran_for.as_secs_f32()
                    ),
                    GiveUpReason::RetriesExhausted => format!(
                        "giving up after {restart_count} consecutive restarts"
                    ),
                };
                tracing::warn!("{id}: {note}");
                self.inner.logs.append(&id, LogStream::Supervisor, note);
            }
        }
    }

    async fn auto_restart(&self, id: &str, attempt: u32) {
        let Ok(entry) = self.entry(id).await else {
            return;
        };
        let result = {
            let Ok(mut lifecycle) = entry.lock(id).await else {
                tracing::debug!("{id}: removed, skipping auto-restart");
                return;
            };
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if lifecycle.state() != LifecycleState::Crashed {
                tracing::debug!("{id}: no longer crashed, skipping auto-restart");
                return;
            }
            lifecycle
                .start(&entry.project(), StartTrigger::AutoRestart { attempt })
                .await
        };
        match result {
            Ok(record) => tracing::info!("{id}: auto-restarted as pid {:?}", record.pid),
            Err(e) => tracing::warn!("{id}: auto-restart failed: {e}"),
        }
        self.persist_logged().await;
    }
}

async fn dispatch_exits(
    inner: Weak<SupervisorInner>,
    mut events: mpsc::UnboundedReceiver<ExitEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = Supervisor { inner };
        // Off the dispatcher so a busy project never delays the others.
        tokio::spawn(async move { supervisor.handle_exit(event).await });
    }
    tracing::debug!("Exit dispatcher stopped");
}

fn check_id(id: &str) -> Result<()> {
    validate_id(id).map_err(|source| SupervisorError::InvalidIdentifier {
        id: id.to_string(),
        source,
    })
}

fn project_info(entry: &Arc<ProjectEntry>) -> ProjectInfo {
    let project = entry.project();
    ProjectInfo {
        id: project.id,
        root: project.root,
        run_command: project.run_command,
        created_at: project.created_at,
        status: entry.snapshot(),
    }
}

/// Probe a pid without signalling it.
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> SupervisorConfig {
        SupervisorConfig {
            projects_dir: dir.join("projects"),
            logs_dir: dir.join("logs"),
            start_grace: Duration::from_millis(150),
            stop_timeout: Duration::from_secs(2),
            ..SupervisorConfig::default()
        }
    }

    #[tokio::test]
    async fn register_validates_and_rejects_duplicates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();

        let rec = sup.register("echo", tmp.path(), "sleep 30").await.unwrap();
        assert_eq!(rec.state, LifecycleState::Stopped);

        assert!(matches!(
            sup.register("echo", tmp.path(), "sleep 30").await,
            Err(SupervisorError::DuplicateProject(_))
        ));
        assert!(matches!(
            sup.register("../etc", tmp.path(), "sleep 30").await,
            Err(SupervisorError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            sup.register("a/b", tmp.path(), "sleep 30").await,
            Err(SupervisorError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            sup.register("quoted", tmp.path(), "echo 'unterminated").await,
            Err(SupervisorError::InvalidCommand(_))
        ));
        assert_eq!(sup.list().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();
        assert!(matches!(
            sup.get("ghost").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            sup.update_command("ghost", "sleep 1").await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            sup.logs("ghost", None).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_project_makes_directory_with_default_command() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();

        sup.create_project("weather").await.unwrap();
        assert!(tmp.path().join("projects/weather").is_dir());
        let info = sup.info("weather").await.unwrap();
        assert_eq!(info.run_command, "python3 main.py");
        assert_eq!(info.root, tmp.path().join("projects/weather"));
    }

    #[tokio::test]
    async fn list_is_ordered() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();
        for id in ["zeta", "alpha", "mid"] {
            sup.register(id, tmp.path(), "sleep 1").await.unwrap();
        }
        assert_eq!(sup.list().await, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn metadata_survives_reload_and_comes_back_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let sup = Supervisor::load(config(tmp.path())).unwrap();
            sup.register("alpha", tmp.path(), "sleep 1").await.unwrap();
            sup.update_command("alpha", "sleep 2").await.unwrap();
        }
        let sup = Supervisor::load(config(tmp.path())).unwrap();
        let info = sup.info("alpha").await.unwrap();
        assert_eq!(info.run_command, "sleep 2");
        assert_eq!(info.status.state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn install_requires_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();
        sup.create_project("bot").await.unwrap();

        let err = sup.install_dependencies("bot").await.unwrap_err();
        assert!(matches!(err, SupervisorError::DependencyInstall { .. }));
        assert!(err.to_string().contains("requirements.txt not found"));
    }

    #[tokio::test]
    async fn install_runs_configured_command() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.install.command = "sh -c 'echo resolving; echo done'".to_string();
        let sup = Supervisor::load(cfg).unwrap();
        sup.create_project("bot").await.unwrap();
        std::fs::write(tmp.path().join("projects/bot/requirements.txt"), "").unwrap();

        let result = sup.install_dependencies("bot").await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, vec!["resolving", "done"]);

        let logs = sup.logs("bot", None).await.unwrap();
        assert!(
            logs.iter()
                .any(|e| e.stream == LogStream::Install && e.line == "done")
        );
    }

    #[tokio::test]
    async fn failed_install_quotes_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.install.command = "sh -c 'echo no matching distribution >&2; exit 1'".to_string();
        let sup = Supervisor::load(cfg).unwrap();
        sup.create_project("bot").await.unwrap();
        std::fs::write(tmp.path().join("projects/bot/requirements.txt"), "nope").unwrap();

        let err = sup.install_dependencies("bot").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 1"), "{message}");
        assert!(message.contains("no matching distribution"), "{message}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_queued_behind_remove_does_not_spawn() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sup = Supervisor::load(config(tmp.path())).unwrap();
        sup.register("bot", tmp.path(), "sleep 30").await.unwrap();

        // Queue remove, then start, behind a held control lock. The mutex is
        // fair, so remove runs first once the guard is dropped.
        let entry = sup.entry("bot").await.unwrap();
        let guard = entry.control.lock().await;
        let remover = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.remove("bot").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let starter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start("bot").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        remover.await.unwrap().unwrap();
        let started = starter.await.unwrap();
        assert!(
            matches!(started, Err(SupervisorError::NotFound(_))),
            "{started:?}"
        );
        assert!(sup.list().await.is_empty());
        assert!(entry.control.lock().await.handle().is_none());

        // The stale entry also refuses every other control operation.
        assert!(matches!(
            entry.lock("bot").await,
            Err(SupervisorError::NotFound(_))
        ));

        // A re-registered project owns the only child for the id.
        sup.register("bot", tmp.path(), "sleep 30").await.unwrap();
        let record = sup.start("bot").await.unwrap();
        assert_eq!(record.state, LifecycleState::Running);
        assert_eq!(sup.service_status().await.running, 1);
        sup.stop("bot").await.unwrap();
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}
