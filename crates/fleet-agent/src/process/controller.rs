use std::{path::Path, process::Stdio, time::Duration};

use tokio::process::Command;

use super::StartParams;
use crate::{error::ProcessError, metrics};

const LAUNCHER: &str = "bin/seatunnel-cluster.sh";
const SERVER_MAIN_CLASS: &str = "org.apache.seatunnel.core.starter.seatunnel.SeaTunnelServer";
const LAUNCH_LOG: &str = "logs/fleet-agent-launch.log";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Terminated,
    Killed,
}

/// OS-level operations on engine processes. Knows nothing about tracking
/// or restart policy.
#[tonic::async_trait]
pub trait ProcessController: Send + Sync + 'static {
    /// Launches the process and returns its PID once it is observable.
    async fn start(&self, params: &StartParams) -> Result<u32, ProcessError>;

    /// SIGTERM, then SIGKILL once `timeout` passes.
    async fn stop(&self, pid: u32, timeout: Duration) -> Result<StopOutcome, ProcessError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Finds a running process matching `params`, if any.
    fn discover(&self, params: &StartParams) -> Option<u32>;
}

/// Runs the engine's cluster launcher in daemon mode and finds the server
/// JVM afterwards by its command line.
#[derive(Debug, Clone)]
pub struct OsProcessController {
    start_timeout: Duration,
}

impl OsProcessController {
    pub fn new(start_timeout: Duration) -> Self {
        Self { start_timeout }
    }
}

/// Does `cmdline` belong to the process described by `params`?
fn cmdline_matches(params: &StartParams, cmdline: &str) -> bool {
    let padded = format!("{cmdline} ");
    match params.launcher_role() {
        Some(role) => padded.contains(&format!(" -r {role} ")),
        None => !padded.contains(" -r master ") && !padded.contains(" -r worker "),
    }
}

fn launch_log(install_dir: &Path) -> Stdio {
    let path = install_dir.join(LAUNCH_LOG);
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Stdio::from(f),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "launch log unavailable");
            Stdio::null()
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: i32) -> Result<bool, ProcessError> {
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(ProcessError::Signal { pid, source: err })
}

#[tonic::async_trait]
impl ProcessController for OsProcessController {
    async fn start(&self, params: &StartParams) -> Result<u32, ProcessError> {
        if let Some(pid) = self.discover(params) {
            tracing::info!(name = %params.name(), pid, "process already running");
            return Ok(pid);
        }

        let install_dir = Path::new(&params.install_dir);
        let launcher = install_dir.join(LAUNCHER);
        if !launcher.is_file() {
            return Err(ProcessError::LauncherNotFound(launcher.display().to_string()));
        }

        let mut cmd = Command::new(&launcher);
        cmd.arg("-d");
        if let Some(role) = params.launcher_role() {
            cmd.arg("-r").arg(role);
        }
        cmd.current_dir(install_dir)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(launch_log(install_dir))
            .stderr(launch_log(install_dir));

        // New session so the engine outlives the agent. No parent-death
        // signal here: agent restarts must not take workloads down.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: launcher.display().to_string(),
            source,
        })?;
        tracing::info!(name = %params.name(), launcher = %launcher.display(), "launcher spawned");

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                return Err(ProcessError::LauncherFailed(status.to_string()));
            }
            Ok(Err(source)) => {
                return Err(ProcessError::Spawn {
                    program: launcher.display().to_string(),
                    source,
                });
            }
            // Exited cleanly, or still running in the foreground.
            Ok(Ok(_)) | Err(_) => {}
        }

        loop {
            if let Some(pid) = self.discover(params) {
                return Ok(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::StartTimeout(self.start_timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    async fn stop(&self, pid: u32, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        if !self.is_alive(pid) || !send_signal(pid, libc::SIGTERM)? {
            return Ok(StopOutcome::AlreadyStopped);
        }
        tracing::info!(pid, timeout_secs = timeout.as_secs(), "sent SIGTERM");

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(pid) {
                return Ok(StopOutcome::Terminated);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::warn!(pid, "process ignored SIGTERM; sending SIGKILL");
        if !send_signal(pid, libc::SIGKILL)? {
            return Ok(StopOutcome::Terminated);
        }
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while self.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::Signal {
                    pid,
                    source: std::io::Error::other("process survived SIGKILL"),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(StopOutcome::Killed)
    }

    #[cfg(not(unix))]
    async fn stop(&self, _pid: u32, _timeout: Duration) -> Result<StopOutcome, ProcessError> {
        Ok(StopOutcome::AlreadyStopped)
    }

    fn is_alive(&self, pid: u32) -> bool {
        metrics::is_pid_alive(pid)
    }

    fn discover(&self, params: &StartParams) -> Option<u32> {
        metrics::find_processes_by_cmdline(&[SERVER_MAIN_CLASS, &params.install_dir])
            .into_iter()
            .find(|(_, cmdline)| cmdline_matches(params, cmdline))
            .map(|(pid, _)| pid)
    }
}
