//! Preview manager: spawns, watches and stops per-project dev servers.

use super::command::DevCommand;
use super::health::{self, HealthAssessment, HealthInputs, MaintenanceAction};
use super::log_buffer::DEFAULT_LOG_CAPACITY;
use super::port_allocator::{PortAllocator, PortUsage, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use super::process::{describe_exit, PreviewProcess, TerminateOutcome};
use super::project_store::{validate_project_id, ProjectStore};
use super::readiness::{HttpProber, ReadinessProbe};
use super::types::{PreviewInfo, PreviewSession, PreviewStatus};
use crate::error::PreviewError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default grace period between SIGTERM and SIGKILL.
const DEFAULT_STOP_GRACE_SECS: u64 = 5;
/// Default time a session may stay `starting`.
const DEFAULT_READY_TIMEOUT_SECS: u64 = 120;
/// Default soft cap on concurrently active previews.
const DEFAULT_MAX_SESSIONS: usize = 8;
/// How often the watcher checks whether the dev server exited.
const EXIT_POLL_INTERVAL_MS: u64 = 250;
/// Buffered output lines between the pipe readers and the watcher.
const OUTPUT_CHANNEL_CAPACITY: usize = 512;
/// Output lines quoted in `lastError` when a dev server dies.
const ERROR_TAIL_LINES: usize = 5;
/// Longest output line kept; the rest of the line is discarded.
const MAX_LINE_BYTES: usize = 8 * 1024;
const TRUNCATED_MARKER: &str = " [truncated]";

/// Runtime settings for a [`PreviewManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// First pool port (inclusive).
    pub port_range_start: u16,
    /// End of the pool (exclusive).
    pub port_range_end: u16,
    pub dev_command: DevCommand,
    pub readiness: ReadinessProbe,
    pub log_capacity: usize,
    pub stop_grace: Duration,
    pub ready_timeout: Duration,
    /// Soft cap used by health scoring; never enforced on start.
    pub max_sessions: usize,
    /// Host used in preview URLs handed to clients.
    pub public_host: String,
    /// Value injected as `HOST` into the dev server environment.
    pub bind_host: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            dev_command: DevCommand::default(),
            readiness: ReadinessProbe::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            public_host: "localhost".to_string(),
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

/// A project from the store, joined with its session if it has one.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPreview {
    pub id: String,
    /// `None` for sessions whose project is no longer in the store.
    pub path: Option<PathBuf>,
    pub preview: Option<PreviewInfo>,
}

/// System-wide view used by the status route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOverview {
    pub projects: Vec<ProjectPreview>,
    pub total_projects: usize,
    pub active_preview: usize,
    pub available_ports: usize,
    pub used_ports: usize,
    pub port_usage: PortUsage,
}

/// Session counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStats {
    pub total_sessions: usize,
    pub starting_sessions: usize,
    pub running_sessions: usize,
    pub failed_sessions: usize,
    pub pool_capacity: usize,
    pub available_ports: usize,
}

/// Outcome of one maintenance step, reported as `{type, result}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub result: String,
}

impl ActionResult {
    fn new(kind: &str, result: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            result: result.into(),
        }
    }
}

/// What the watcher should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    Starting,
    Running,
    Done,
}

/// Owns the session table and port pool for all previews.
///
/// Table and pool mutations happen in short critical sections with no
/// `.await` inside. Operations on the same project are serialized through a
/// per-project async lock, so replace-before-start is atomic for callers.
pub struct PreviewManager {
    /// Map of project id to its (single) session.
    sessions: Mutex<HashMap<String, PreviewSession>>,
    /// Per-project operation locks.
    project_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    port_allocator: PortAllocator,
    store: Arc<dyn ProjectStore>,
    prober: HttpProber,
    /// Queue drained by the status mirror thread.
    mirror_tx: std_mpsc::Sender<PreviewInfo>,
    config: ManagerConfig,
    started_at: Instant,
}

impl PreviewManager {
    pub fn new(config: ManagerConfig, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            project_locks: Mutex::new(HashMap::new()),
            port_allocator: PortAllocator::new(config.port_range_start, config.port_range_end),
            mirror_tx: spawn_mirror_writer(store.clone()),
            store,
            prober: HttpProber::new(),
            config,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ProjectStore {
        self.store.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PreviewSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn project_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.project_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(project_id.to_string()).or_default().clone()
    }

    /// Run `f` on the session for `project_id`, but only if it is still the
    /// session identified by `session_id`.
    fn with_session<R>(
        &self,
        project_id: &str,
        session_id: Uuid,
        f: impl FnOnce(&mut PreviewSession) -> R,
    ) -> Option<R> {
        let mut table = self.table();
        let session = table.get_mut(project_id)?;
        if session.session_id() != session_id {
            return None;
        }
        Some(f(session))
    }

    /// Queue a snapshot for the mirror thread. Never blocks.
    fn mirror(&self, info: &PreviewInfo) {
        if self.mirror_tx.send(info.clone()).is_err() {
            debug!(project_id = %info.project_id, "Status mirror thread gone; skipping");
        }
    }

    /// Start (or replace) the preview for `project_id`.
    ///
    /// Returns as soon as the dev server is spawned, with status `starting`;
    /// readiness is tracked in the background and observed via [`get_status`].
    /// When the project cannot be resolved or the process cannot be spawned,
    /// the failed session stays queryable and the error is returned.
    ///
    /// [`get_status`]: Self::get_status
    pub async fn start_preview(self: &Arc<Self>, project_id: &str) -> Result<PreviewInfo, PreviewError> {
        validate_project_id(project_id)?;
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if self.teardown(project_id).await.is_some() {
            info!(project_id = %project_id, "Replaced existing preview");
        }

        let port = self.port_allocator.allocate().ok_or_else(|| {
            warn!(project_id = %project_id, "Preview pool exhausted");
            PreviewError::NoPortsAvailable
        })?;

        let session = PreviewSession::new(
            project_id,
            port,
            &self.config.public_host,
            self.config.log_capacity,
        );
        let session_id = session.session_id();
        info!(project_id = %project_id, session_id = %session_id, port, "Starting preview");
        self.table().insert(project_id.to_string(), session);

        let launched = self
            .store
            .resolve_source_dir(project_id)
            .and_then(|dir| self.config.dev_command.build(port, &self.config.bind_host, &dir))
            .and_then(PreviewProcess::spawn);
        let mut process = match launched {
            Ok(process) => process,
            Err(e) => return Err(self.record_start_failure(project_id, session_id, e)),
        };

        let (stdout, stderr) = process.take_output();
        let info = self
            .with_session(project_id, session_id, |s| {
                s.attach_process(process);
                s.snapshot()
            })
            .ok_or_else(|| PreviewError::ProjectNotFound(project_id.to_string()))?;
        self.mirror(&info);

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = stdout {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);
        tokio::spawn(watch_session(
            Arc::downgrade(self),
            project_id.to_string(),
            session_id,
            port,
            rx,
        ));

        Ok(info)
    }

    fn record_start_failure(&self, project_id: &str, session_id: Uuid, err: PreviewError) -> PreviewError {
        warn!(project_id = %project_id, error = %err, "Preview failed to start");
        let released = self.with_session(project_id, session_id, |s| {
            s.mark_failed(err.to_string());
            s.push_log(err.to_string());
            (s.take_port_claim(), s.snapshot())
        });
        if let Some((port, info)) = released {
            if let Some(port) = port {
                self.port_allocator.release(port);
            }
            self.mirror(&info);
        }
        err
    }

    /// Current state of the project's session, if it has one.
    pub fn get_status(&self, project_id: &str) -> Option<PreviewInfo> {
        self.table().get(project_id).map(PreviewSession::snapshot)
    }

    /// Stop and forget the project's session. Returns `false` if there was none.
    pub async fn stop_preview(&self, project_id: &str) -> bool {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;
        self.teardown(project_id).await.is_some()
    }

    /// Remove the session, terminate its process, then free its port.
    ///
    /// Callers must hold the project lock. Returns the final snapshot.
    async fn teardown(&self, project_id: &str) -> Option<PreviewInfo> {
        let mut session = self.table().remove(project_id)?;
        session.mark_stopped();
        let info = session.snapshot();

        if let Some(process) = session.take_process() {
            let outcome = process.terminate(self.config.stop_grace).await;
            if outcome == TerminateOutcome::Killed {
                warn!(project_id = %project_id, port = info.port, "Dev server had to be killed");
            }
        }
        if let Some(port) = session.take_port_claim() {
            self.port_allocator.release(port);
        }

        info!(project_id = %project_id, port = info.port, status = %info.status, "Preview stopped");
        self.mirror(&info);
        Some(info)
    }

    /// Stop every active session. Each stop is attempted independently.
    pub async fn stop_all(&self) -> usize {
        let project_ids: Vec<String> = {
            let table = self.table();
            table
                .iter()
                .filter(|(_, s)| s.status().is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut stopped = 0;
        for project_id in project_ids {
            if self.stop_preview(&project_id).await {
                stopped += 1;
            } else {
                debug!(project_id = %project_id, "Session already gone during stop_all");
            }
        }
        info!(stopped, "Stopped all previews");
        stopped
    }

    /// Start a fresh session for a project that currently has one.
    pub async fn restart(self: &Arc<Self>, project_id: &str) -> Result<PreviewInfo, PreviewError> {
        if self.get_status(project_id).is_none() {
            return Err(PreviewError::ProjectNotFound(project_id.to_string()));
        }
        self.start_preview(project_id).await
    }

    /// Drop failed and stopped records. Returns how many were removed.
    pub fn purge_terminal(&self) -> usize {
        let mut removed: Vec<PreviewSession> = {
            let mut table = self.table();
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, s)| s.status().is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for session in &mut removed {
            if let Some(port) = session.take_port_claim() {
                self.port_allocator.release(port);
            }
        }
        if !removed.is_empty() {
            info!(purged = removed.len(), "Purged terminal preview records");
        }
        removed.len()
    }

    /// Forget per-project locks nobody is using. Returns how many were dropped.
    fn prune_project_locks(&self) -> usize {
        let table = self.table();
        let mut locks = self.project_locks.lock().unwrap_or_else(|e| e.into_inner());
        let before = locks.len();
        locks.retain(|id, lock| Arc::strong_count(lock) > 1 || table.contains_key(id));
        before - locks.len()
    }

    /// Sessions that are starting or running.
    pub fn list_active(&self) -> Vec<PreviewInfo> {
        let mut active: Vec<PreviewInfo> = self
            .table()
            .values()
            .filter(|s| s.status().is_active())
            .map(PreviewSession::snapshot)
            .collect();
        active.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        active
    }

    /// Every tracked session, including failed records.
    pub fn list_sessions(&self) -> Vec<PreviewInfo> {
        let mut all: Vec<PreviewInfo> = self.table().values().map(PreviewSession::snapshot).collect();
        all.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        all
    }

    pub fn port_usage(&self) -> PortUsage {
        self.port_allocator.usage()
    }

    pub fn stats(&self) -> PreviewStats {
        let table = self.table();
        let count = |status: PreviewStatus| table.values().filter(|s| s.status() == status).count();
        PreviewStats {
            total_sessions: table.len(),
            starting_sessions: count(PreviewStatus::Starting),
            running_sessions: count(PreviewStatus::Running),
            failed_sessions: count(PreviewStatus::Failed),
            pool_capacity: self.port_allocator.capacity(),
            available_ports: self.port_allocator.available_count(),
        }
    }

    /// Projects from the store cross-referenced with tracked sessions.
    ///
    /// The session table is authoritative; anything the store has mirrored
    /// is ignored here.
    pub fn overview(&self) -> PreviewOverview {
        let mut sessions: HashMap<String, PreviewInfo> = self
            .list_sessions()
            .into_iter()
            .map(|info| (info.project_id.clone(), info))
            .collect();

        let mut projects: Vec<ProjectPreview> = self
            .store
            .list_projects()
            .into_iter()
            .map(|p| ProjectPreview {
                preview: sessions.remove(&p.id),
                id: p.id,
                path: Some(p.path),
            })
            .collect();
        let mut orphans: Vec<ProjectPreview> = sessions
            .into_values()
            .map(|info| ProjectPreview {
                id: info.project_id.clone(),
                path: None,
                preview: Some(info),
            })
            .collect();
        orphans.sort_by(|a, b| a.id.cmp(&b.id));
        projects.extend(orphans);

        let active_preview = projects
            .iter()
            .filter(|p| p.preview.as_ref().is_some_and(|i| i.status.is_active()))
            .count();
        let port_usage = self.port_usage();
        PreviewOverview {
            total_projects: projects.len(),
            active_preview,
            available_ports: port_usage.available.len(),
            used_ports: port_usage.used.len(),
            port_usage,
            projects,
        }
    }

    /// Health counters, optionally with an external memory reading.
    pub fn health_inputs(&self, memory_percent: Option<f64>) -> HealthInputs {
        let stats = self.stats();
        HealthInputs {
            active_sessions: stats.starting_sessions + stats.running_sessions,
            max_sessions: self.config.max_sessions,
            pool_capacity: stats.pool_capacity,
            free_ports: stats.available_ports,
            failed_sessions: stats.failed_sessions,
            memory_percent,
        }
    }

    pub fn assess_health(&self, memory_percent: Option<f64>) -> HealthAssessment {
        health::assess(&self.health_inputs(memory_percent))
    }

    /// Best-effort maintenance. Individual failures are reported, never fatal.
    pub async fn maintain(self: &Arc<Self>, action: MaintenanceAction) -> Vec<ActionResult> {
        info!(action = %action, "Running maintenance");
        match action {
            MaintenanceAction::Cleanup => {
                let stopped = self.stop_all().await;
                let purged = self.purge_terminal();
                vec![
                    ActionResult::new("stop_all", format!("stopped {stopped} preview(s)")),
                    ActionResult::new("purge", format!("removed {purged} failed record(s)")),
                ]
            }
            MaintenanceAction::Restart => {
                let active = self.list_active();
                if active.is_empty() {
                    return vec![ActionResult::new("restart", "no active previews")];
                }
                let mut results = Vec::with_capacity(active.len());
                for info in active {
                    let result = match self.restart(&info.project_id).await {
                        Ok(new) => format!("{}: restarted on port {}", info.project_id, new.port),
                        Err(e) => {
                            warn!(project_id = %info.project_id, error = %e, "Restart failed");
                            format!("{}: {e}", info.project_id)
                        }
                    };
                    results.push(ActionResult::new("restart", result));
                }
                results
            }
            MaintenanceAction::Gc => {
                let purged = self.purge_terminal();
                let pruned = self.prune_project_locks();
                vec![ActionResult::new(
                    "gc",
                    format!("removed {purged} terminal record(s), pruned {pruned} idle lock(s)"),
                )]
            }
        }
    }

    fn on_output(&self, project_id: &str, session_id: Uuid, line: String) -> Watch {
        debug!(project_id = %project_id, "{line}");
        let ready = self.config.readiness.matches_line(&line);
        let outcome = self.with_session(project_id, session_id, |s| {
            s.push_log(line);
            let became_ready = ready && s.mark_running();
            (watch_state(s.status()), became_ready.then(|| s.snapshot()))
        });
        match outcome {
            Some((state, Some(info))) => {
                info!(project_id = %project_id, url = ?info.url, "Preview ready");
                self.mirror(&info);
                state
            }
            Some((state, None)) => state,
            None => Watch::Done,
        }
    }

    fn on_probe_success(&self, project_id: &str, session_id: Uuid) -> Watch {
        let outcome = self.with_session(project_id, session_id, |s| {
            let became_ready = s.mark_running();
            (watch_state(s.status()), became_ready.then(|| s.snapshot()))
        });
        match outcome {
            Some((state, Some(info))) => {
                info!(project_id = %project_id, url = ?info.url, "Preview ready");
                self.mirror(&info);
                state
            }
            Some((state, None)) => state,
            None => Watch::Done,
        }
    }

    fn current_state(&self, project_id: &str, session_id: Uuid) -> Watch {
        self.with_session(project_id, session_id, |s| watch_state(s.status()))
            .unwrap_or(Watch::Done)
    }

    /// Detect a dead dev server and fail the session.
    fn check_exit(&self, project_id: &str, session_id: Uuid) -> Watch {
        let outcome = self.with_session(project_id, session_id, |s| {
            let exited = match s.process_mut().map(|p| p.try_exit()) {
                Some(Ok(Some(status))) => describe_exit(status),
                Some(Ok(None)) => return (watch_state(s.status()), None),
                Some(Err(e)) => format!("lost track of process: {e}"),
                None => return (Watch::Done, None),
            };
            let tail = s.logs().tail(ERROR_TAIL_LINES).join("\n");
            let message = match s.status() {
                PreviewStatus::Starting => format!("dev server {exited} before becoming ready"),
                _ => PreviewError::UnexpectedExit(exited).to_string(),
            };
            let message = if tail.is_empty() {
                message
            } else {
                format!("{message}\n{tail}")
            };
            s.mark_failed(message);
            // The leader is gone but the rest of its group may still hold the port.
            if let Some(mut process) = s.take_process() {
                process.kill_group();
            }
            (Watch::Done, Some((s.take_port_claim(), s.snapshot())))
        });

        match outcome {
            Some((state, Some((port, info)))) => {
                if let Some(port) = port {
                    self.port_allocator.release(port);
                }
                warn!(project_id = %project_id, error = ?info.error, "Preview failed");
                self.mirror(&info);
                state
            }
            Some((state, None)) => state,
            None => Watch::Done,
        }
    }

    /// Fail a session that never became ready and terminate its process.
    async fn expire_starting(&self, project_id: &str, session_id: Uuid) {
        let timeout_secs = self.config.ready_timeout.as_secs();
        let expired = self.with_session(project_id, session_id, |s| {
            if s.status() != PreviewStatus::Starting {
                return None;
            }
            s.mark_failed(PreviewError::ReadyTimeout(timeout_secs).to_string());
            Some((s.take_process(), s.take_port_claim(), s.snapshot()))
        });
        let Some(Some((process, port, info))) = expired else {
            return;
        };

        warn!(project_id = %project_id, timeout_secs, "Preview never became ready");
        if let Some(process) = process {
            process.terminate(self.config.stop_grace).await;
        }
        if let Some(port) = port {
            self.port_allocator.release(port);
        }
        self.mirror(&info);
    }
}

/// Start the thread that writes status mirrors in order, off the async runtime.
///
/// The thread exits once the manager (the only sender) is dropped.
fn spawn_mirror_writer(store: Arc<dyn ProjectStore>) -> std_mpsc::Sender<PreviewInfo> {
    let (tx, rx) = std_mpsc::channel::<PreviewInfo>();
    let spawned = thread::Builder::new()
        .name("preview-mirror".to_string())
        .spawn(move || {
            for info in rx {
                if let Err(e) = store.mirror_status(&info.project_id, &info) {
                    warn!(project_id = %info.project_id, error = %e, "Status mirroring failed");
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not start status mirror thread; mirroring disabled");
    }
    tx
}

fn watch_state(status: PreviewStatus) -> Watch {
    match status {
        PreviewStatus::Starting => Watch::Starting,
        PreviewStatus::Running => Watch::Running,
        PreviewStatus::Failed | PreviewStatus::Stopped => Watch::Done,
    }
}

/// Render a raw output line: lossy UTF-8, without the line terminator.
fn decode_line(raw: &[u8], truncated: bool) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let mut line = String::from_utf8_lossy(raw).into_owned();
    if truncated {
        line.push_str(TRUNCATED_MARKER);
    }
    line
}

/// Forward output lines to the watcher, draining the pipe until EOF.
///
/// Lines longer than `MAX_LINE_BYTES` are truncated. The pipe keeps being
/// read after the watcher goes away so the dev server never hits SIGPIPE.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut forwarding = true;

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "Dev server output closed with error");
                break;
            }
        };
        if chunk.is_empty() {
            if forwarding && !line.is_empty() {
                let _ = tx.send(decode_line(&line, truncated)).await;
            }
            break;
        }

        let (take, complete) = match chunk.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(line.len());
        if take > room {
            truncated = true;
        }
        line.extend_from_slice(&chunk[..take.min(room)]);
        reader.consume(take);

        if complete {
            if forwarding && tx.send(decode_line(&line, truncated)).await.is_err() {
                forwarding = false;
            }
            line.clear();
            truncated = false;
        }
    }
}

/// Per-session watcher: captures output, detects readiness and exit.
///
/// Holds only a weak reference so a dropped manager ends its watchers.
async fn watch_session(
    manager: Weak<PreviewManager>,
    project_id: String,
    session_id: Uuid,
    port: u16,
    mut output: mpsc::Receiver<String>,
) {
    let Some((readiness, prober, ready_timeout)) = manager.upgrade().map(|m| {
        (
            m.config.readiness.clone(),
            m.prober.clone(),
            m.config.ready_timeout,
        )
    }) else {
        return;
    };

    let deadline = tokio::time::Instant::now() + ready_timeout;
    let probe_url = readiness.probe_url(port);
    let mut probe_tick = interval(readiness.poll_interval().unwrap_or(Duration::from_secs(1)));
    probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exit_tick = interval(Duration::from_millis(EXIT_POLL_INTERVAL_MS));
    exit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut state = Watch::Starting;
    let mut output_open = true;

    while state != Watch::Done {
        tokio::select! {
            line = output.recv(), if output_open => {
                let Some(manager) = manager.upgrade() else { break };
                match line {
                    Some(line) => state = manager.on_output(&project_id, session_id, line),
                    None => {
                        output_open = false;
                        state = manager.check_exit(&project_id, session_id);
                    }
                }
            }
            _ = probe_tick.tick(), if state == Watch::Starting && probe_url.is_some() => {
                let Some(manager) = manager.upgrade() else { break };
                let Some(url) = probe_url.as_deref() else { continue };
                state = if prober.is_up(url).await {
                    manager.on_probe_success(&project_id, session_id)
                } else {
                    manager.current_state(&project_id, session_id)
                };
            }
            _ = exit_tick.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                state = manager.check_exit(&project_id, session_id);
            }
            _ = sleep_until(deadline), if state == Watch::Starting => {
                let Some(manager) = manager.upgrade() else { break };
                manager.expire_starting(&project_id, session_id).await;
                state = manager.current_state(&project_id, session_id);
            }
        }
    }
    debug!(project_id = %project_id, session_id = %session_id, "Watcher finished");
}
