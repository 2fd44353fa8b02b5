//! Owned handle to a dev-server subprocess.
//!
//! On unix the child leads its own process group, so signals reach the
//! whole tree (`npm` -> `node` -> bundler) instead of only the wrapper.

use crate::error::PreviewError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

/// How often a stopping process group is checked for survivors.
const GROUP_POLL_MS: u64 = 50;

/// How a terminate request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited before any signal was sent.
    AlreadyExited,
    /// The whole process group exited within the grace period.
    Graceful,
    /// The grace period elapsed and the process group was killed.
    Killed,
}

/// A spawned dev server. Exclusively owned by its session; never cloned.
pub struct PreviewProcess {
    child: Child,
    pid: Option<u32>,
    /// Set once the whole process group is known to be gone.
    group_reaped: bool,
}

impl PreviewProcess {
    /// Spawn `command` with piped output and its own process group.
    pub fn spawn(mut command: Command) -> Result<Self, PreviewError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| PreviewError::SpawnFailure(e.to_string()))?;
        let pid = child.id();
        debug!(pid = ?pid, "Spawned dev server");
        Ok(Self {
            child,
            pid,
            group_reaped: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output pipes for the log watcher. Returns `None`s after the first call.
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Non-blocking exit check of the group leader.
    pub fn try_exit(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask the process group to stop, escalating to SIGKILL after `grace`.
    ///
    /// The grace period covers the whole group: members that outlive the
    /// leader are killed once it runs out.
    pub async fn terminate(mut self, grace: Duration) -> TerminateOutcome {
        if let Ok(Some(_)) = self.child.try_wait() {
            self.kill_group();
            return TerminateOutcome::AlreadyExited;
        }

        let deadline = Instant::now() + grace;
        self.signal_graceful();
        match timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, status = %describe_exit(status), "Dev server leader exited");
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Failed waiting for dev server; killing");
                self.force_kill().await;
                return TerminateOutcome::Killed;
            }
            Err(_) => {
                let err = PreviewError::StopTimeout(grace.as_secs());
                warn!(pid = ?self.pid, error = %err, "Escalating to SIGKILL");
                self.force_kill().await;
                return TerminateOutcome::Killed;
            }
        }

        while self.group_alive() {
            if Instant::now() >= deadline {
                let err = PreviewError::StopTimeout(grace.as_secs());
                warn!(pid = ?self.pid, error = %err, "Process group outlived its leader; escalating to SIGKILL");
                self.kill_group();
                return TerminateOutcome::Killed;
            }
            sleep(Duration::from_millis(GROUP_POLL_MS)).await;
        }
        self.group_reaped = true;
        TerminateOutcome::Graceful
    }

    #[cfg(unix)]
    fn signal_graceful(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM to process group failed");
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn force_kill(&mut self) {
        self.kill_group();
        let _ = self.child.kill().await;
    }

    /// SIGKILL every member of the group, whatever state the leader is in.
    /// A group that is already gone (ESRCH) is not an error.
    #[cfg(unix)]
    pub fn kill_group(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if self.group_reaped {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => self.group_reaped = true,
            Err(e) => debug!(pid, error = %e, "SIGKILL to process group failed"),
        }
    }

    #[cfg(not(unix))]
    pub fn kill_group(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Whether any member of the group still exists (zombies included).
    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => !matches!(killpg(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH)),
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }
}

impl Drop for PreviewProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the direct child
        self.kill_group();
    }
}

/// Human-readable exit description for `lastError`.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn terminate_running_process_gracefully() {
        let process = PreviewProcess::spawn(sh("exec sleep 30")).unwrap();
        assert!(process.pid().is_some());
        let outcome = process.terminate(Duration::from_secs(5)).await;
        assert_eq!(outcome, TerminateOutcome::Graceful);
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_ignored() {
        let process = PreviewProcess::spawn(sh("trap '' TERM; while true; do sleep 1; done")).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = process.terminate(Duration::from_millis(300)).await;
        assert_eq!(outcome, TerminateOutcome::Killed);
    }

    #[tokio::test]
    async fn terminate_after_exit_is_noop() {
        let mut process = PreviewProcess::spawn(sh("exit 0")).unwrap();
        for _ in 0..50 {
            if process.try_exit().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let outcome = process.terminate(Duration::from_secs(1)).await;
        assert_eq!(outcome, TerminateOutcome::AlreadyExited);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        // Zombies count as gone: they hold no port and are only waiting to be reaped.
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| !rest.trim_start().starts_with('Z')))
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    async fn read_pid(path: &std::path::Path) -> i32 {
        for _ in 0..100 {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..100 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_kills_group_members_that_outlive_the_leader() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cmd = sh(
            "sh -c 'trap \"\" TERM; while true; do sleep 1; done' & echo $! > survivor.pid; exec sleep 30",
        );
        cmd.current_dir(dir.path());
        let process = PreviewProcess::spawn(cmd).unwrap();
        let survivor = read_pid(&dir.path().join("survivor.pid")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = process.terminate(Duration::from_millis(500)).await;
        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(wait_until_gone(survivor).await, "survivor {survivor} still running");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_an_exited_leader_kills_its_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cmd = sh("sleep 30 & echo $! > child.pid; exit 1");
        cmd.current_dir(dir.path());
        let mut process = PreviewProcess::spawn(cmd).unwrap();
        let child = read_pid(&dir.path().join("child.pid")).await;
        for _ in 0..100 {
            if process.try_exit().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(is_running(child));

        drop(process);
        assert!(wait_until_gone(child).await, "grandchild {child} still running");
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let err = PreviewProcess::spawn(Command::new("/nonexistent/dev-server")).err();
        assert!(matches!(err, Some(PreviewError::SpawnFailure(_))));
    }

    #[tokio::test]
    async fn describe_nonzero_exit() {
        let status = sh("exit 3").status().await.unwrap();
        assert_eq!(describe_exit(status), "exited with code 3");
    }
}
