//! Preview session and status types.

use super::log_buffer::LogBuffer;
use super::process::PreviewProcess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a preview session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    /// Process spawned, waiting for readiness.
    Starting,
    /// Dev server is accepting connections.
    Running,
    /// Spawn failed, readiness never came, or the process died.
    Failed,
    /// Explicitly stopped.
    Stopped,
}

impl PreviewStatus {
    /// Failed and stopped sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, PreviewStatus::Failed | PreviewStatus::Stopped)
    }

    /// Starting or running.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges: starting -> running|failed|stopped, running -> failed|stopped.
    pub fn can_transition_to(self, next: PreviewStatus) -> bool {
        use PreviewStatus::*;
        matches!(
            (self, next),
            (Starting, Running) | (Starting, Failed) | (Starting, Stopped) | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

impl std::fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewStatus::Starting => write!(f, "starting"),
            PreviewStatus::Running => write!(f, "running"),
            PreviewStatus::Failed => write!(f, "failed"),
            PreviewStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a session (serializable for API responses).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    /// Identity of this particular session; a restart yields a new one.
    pub session_id: Uuid,
    pub project_id: String,
    pub port: u16,
    pub status: PreviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Only set while running.
    pub url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    /// Last failure message, set when status is failed.
    pub error: Option<String>,
    pub build_logs: Vec<String>,
    /// Output lines evicted from `build_logs` since the session started.
    pub dropped_log_lines: u64,
}

/// A tracked preview and, while alive, the dev-server process it owns.
pub struct PreviewSession {
    session_id: Uuid,
    project_id: String,
    port: u16,
    /// Whether this session still owns `port` in the allocator.
    port_claimed: bool,
    host: String,
    status: PreviewStatus,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    logs: LogBuffer,
    process: Option<PreviewProcess>,
}

impl PreviewSession {
    /// Create a session in the `starting` state.
    pub fn new(project_id: &str, port: u16, host: &str, log_capacity: usize) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            port,
            port_claimed: true,
            host: host.to_string(),
            status: PreviewStatus::Starting,
            pid: None,
            started_at: Utc::now(),
            ready_at: None,
            last_error: None,
            logs: LogBuffer::new(log_capacity),
            process: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Give up the port claim. Returns the port only the first time, so a
    /// port reassigned to another session is never released twice.
    pub fn take_port_claim(&mut self) -> Option<u16> {
        std::mem::take(&mut self.port_claimed).then_some(self.port)
    }

    pub fn status(&self) -> PreviewStatus {
        self.status
    }

    /// Preview URL, derived from the port once running.
    pub fn url(&self) -> Option<String> {
        (self.status == PreviewStatus::Running).then(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push_line(line);
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Hand the spawned process to this session.
    pub fn attach_process(&mut self, process: PreviewProcess) {
        self.pid = process.pid();
        self.process = Some(process);
    }

    /// Take ownership of the process back, leaving the session without one.
    pub fn take_process(&mut self) -> Option<PreviewProcess> {
        self.process.take()
    }

    pub fn process_mut(&mut self) -> Option<&mut PreviewProcess> {
        self.process.as_mut()
    }

    /// starting -> running. Sets `ready_at` exactly once.
    pub fn mark_running(&mut self) -> bool {
        if !self.transition(PreviewStatus::Running) {
            return false;
        }
        self.ready_at = Some(Utc::now());
        true
    }

    /// starting|running -> failed, recording the error.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(PreviewStatus::Failed) {
            return false;
        }
        self.last_error = Some(error.into());
        true
    }

    /// starting|running -> stopped.
    pub fn mark_stopped(&mut self) -> bool {
        self.transition(PreviewStatus::Stopped)
    }

    fn transition(&mut self, next: PreviewStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn snapshot(&self) -> PreviewInfo {
        PreviewInfo {
            session_id: self.session_id,
            project_id: self.project_id.clone(),
            port: self.port,
            status: self.status,
            pid: self.pid,
            url: self.url(),
            started_at: self.started_at,
            ready_at: self.ready_at,
            error: self.last_error.clone(),
            build_logs: self.logs.lines(),
            dropped_log_lines: self.logs.dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PreviewSession {
        PreviewSession::new("demo", 3002, "localhost", 16)
    }

    #[test]
    fn new_session_is_starting_without_url() {
        let s = session();
        assert_eq!(s.status(), PreviewStatus::Starting);
        assert!(s.url().is_none());
        assert!(s.snapshot().ready_at.is_none());
    }

    #[test]
    fn running_sets_url_and_ready_time_once() {
        let mut s = session();
        assert!(s.mark_running());
        let ready = s.snapshot().ready_at;
        assert!(ready.is_some());
        assert_eq!(s.url().as_deref(), Some("http://localhost:3002"));

        assert!(!s.mark_running());
        assert_eq!(s.snapshot().ready_at, ready);
    }

    #[test]
    fn terminal_states_do_not_resurrect() {
        let mut s = session();
        assert!(s.mark_failed("exit code 1"));
        assert!(!s.mark_running());
        assert!(!s.mark_stopped());
        assert_eq!(s.status(), PreviewStatus::Failed);
        assert_eq!(s.snapshot().error.as_deref(), Some("exit code 1"));

        let mut s = session();
        assert!(s.mark_running());
        assert!(s.mark_stopped());
        assert!(!s.mark_failed("late exit"));
        assert_eq!(s.status(), PreviewStatus::Stopped);
        assert!(s.snapshot().error.is_none());
        assert!(s.url().is_none());
    }

    #[test]
    fn running_can_fail() {
        let mut s = session();
        s.mark_running();
        assert!(s.mark_failed("killed"));
        assert_eq!(s.status(), PreviewStatus::Failed);
    }

    #[test]
    fn port_claim_is_taken_once() {
        let mut s = session();
        assert_eq!(s.take_port_claim(), Some(3002));
        assert_eq!(s.take_port_claim(), None);
    }

    #[test]
    fn fresh_sessions_get_new_identity() {
        assert_ne!(session().session_id(), session().session_id());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut s = session();
        s.push_log("vite v5 ready");
        let value = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(value["status"], "starting");
        assert_eq!(value["projectId"], "demo");
        assert_eq!(value["buildLogs"][0], "vite v5 ready");
        assert!(value["readyAt"].is_null());
        assert!(value.get("pid").is_none());
        assert_eq!(value["droppedLogLines"], 0);
    }

    #[test]
    fn snapshot_counts_evicted_lines() {
        let mut s = PreviewSession::new("demo", 3002, "localhost", 2);
        for i in 0..5 {
            s.push_log(format!("line {i}"));
        }
        let info = s.snapshot();
        assert_eq!(info.build_logs, vec!["line 3", "line 4"]);
        assert_eq!(info.dropped_log_lines, 3);
    }
}
