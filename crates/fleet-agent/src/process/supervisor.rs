use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use anyhow::Context;
use fleet_process::{ProcessEvent, ProcessEventType, RestartConfig, SupervisionState};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    AutoRestartPolicy, ProcessController, ProcessMonitor, RestartDecision, StartParams,
    StopOutcome, TrackedProcess,
};
use crate::error::ProcessError;

const TRACKED_FILE: &str = "tracked-processes.json";

/// Receives every lifecycle event the supervisor produces.
pub type EventCallback = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReport {
    Started(u32),
    AlreadyRunning(u32),
}

impl StartReport {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Started(pid) | Self::AlreadyRunning(pid) => *pid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReport {
    Stopped { pid: u32, outcome: StopOutcome },
    AlreadyStopped,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedProcess {
    pid: u32,
    state: SupervisionState,
    params: StartParams,
}

struct SupervisorInner {
    tracked: Mutex<HashMap<String, TrackedProcess>>,
    controller: Arc<dyn ProcessController>,
    policy: AutoRestartPolicy,
    monitor: ProcessMonitor,
    on_event: RwLock<Option<EventCallback>>,
    state_dir: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
    restarts: TaskTracker,
    cancel: CancellationToken,
}

/// Owns the tracked-process table. Commands, the monitor and restart
/// attempts all go through here; per-name locks keep them from racing.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("tracked", &self.tracked_names())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(
        controller: Arc<dyn ProcessController>,
        restart: RestartConfig,
        monitor_interval: Duration,
        state_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                tracked: Mutex::new(HashMap::new()),
                controller,
                policy: AutoRestartPolicy::new(restart),
                monitor: ProcessMonitor::new(monitor_interval),
                on_event: RwLock::new(None),
                state_dir,
                persist_lock: tokio::sync::Mutex::new(()),
                restarts: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        *self
            .inner
            .on_event
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub(crate) fn emit(&self, event: ProcessEvent) {
        tracing::info!(
            event = event.event_type.as_str(),
            name = %event.name,
            pid = event.pid,
            "process event"
        );
        let callback = self
            .inner
            .on_event
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match callback {
            Some(cb) => cb(event),
            None => tracing::debug!("no event callback installed; event dropped"),
        }
    }

    pub fn controller(&self) -> &Arc<dyn ProcessController> {
        &self.inner.controller
    }

    pub fn policy(&self) -> &AutoRestartPolicy {
        &self.inner.policy
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.inner.monitor
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn restart_config(&self) -> RestartConfig {
        self.inner.policy.config()
    }

    pub fn set_restart_config(&self, config: RestartConfig) {
        let prev = self.inner.policy.set_config(config);
        if prev.enabled != config.enabled {
            tracing::info!(enabled = config.enabled, "auto-restart toggled");
        }
    }

    pub fn set_monitor_interval(&self, interval: Duration) {
        self.inner.monitor.set_interval(interval);
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedProcess>> {
        self.inner.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracked_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_tracked().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<TrackedProcess> {
        self.lock_tracked().get(name).cloned()
    }

    /// All tracked processes, sorted by name.
    pub fn snapshot(&self) -> Vec<TrackedProcess> {
        let mut all: Vec<TrackedProcess> = self.lock_tracked().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub(crate) fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut TrackedProcess) -> R,
    ) -> Option<R> {
        self.lock_tracked().get_mut(name).map(f)
    }

    fn insert(&self, entry: TrackedProcess) {
        self.lock_tracked().insert(entry.name.clone(), entry);
    }

    fn event_for(&self, event_type: ProcessEventType, entry: &TrackedProcess, pid: u32) -> ProcessEvent {
        ProcessEvent::new(event_type, &entry.name, pid, entry.install_dir(), entry.role())
    }

    /// Emits `started` when the entry's origin calls for it; silently
    /// tracked processes stay quiet.
    pub(crate) fn announce_start(&self, entry: &TrackedProcess, discovered: bool) {
        if !entry.announces_start() {
            tracing::debug!(name = %entry.name, pid = entry.pid, "tracking silently");
            return;
        }
        let mut event = self.event_for(ProcessEventType::Started, entry, entry.pid);
        if discovered {
            event = event.with_detail("discovered", "true");
        }
        self.emit(event);
    }

    /// Loads the table persisted by a previous agent run and re-adopts the
    /// processes silently. Fails only when the state dir is unusable.
    pub async fn start(&self) -> anyhow::Result<usize> {
        let Some(dir) = self.inner.state_dir.clone() else {
            return Ok(0);
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create state dir {}", dir.display()))?;

        let path = dir.join(TRACKED_FILE);
        let persisted: Vec<PersistedProcess> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt tracked-process table");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", path.display()));
            }
        };

        let count = persisted.len();
        for p in persisted {
            let alive = p.pid > 0 && self.inner.controller.is_alive(p.pid);
            let mut entry = TrackedProcess::declared_silent(p.params, if alive { p.pid } else { 0 });
            if !alive {
                entry.last_pid = p.pid;
                entry.state = match p.state {
                    SupervisionState::StoppedIntentionally => SupervisionState::StoppedIntentionally,
                    _ => SupervisionState::Unknown,
                };
            }
            tracing::info!(name = %entry.name, pid = entry.pid, state = entry.state.as_str(), "re-adopted tracked process");
            self.insert(entry);
        }
        Ok(count)
    }

    /// Writes the current table if a state dir is configured. Failures are
    /// logged; supervision continues from memory.
    pub(crate) async fn persist(&self) {
        let Some(dir) = self.inner.state_dir.as_deref() else {
            return;
        };
        let _guard = self.inner.persist_lock.lock().await;
        let table: Vec<PersistedProcess> = self
            .snapshot()
            .into_iter()
            .map(|t| PersistedProcess {
                pid: t.pid,
                state: t.state,
                params: t.params,
            })
            .collect();
        if let Err(e) = crate::config::write_json_atomic(dir, TRACKED_FILE, &table).await {
            tracing::warn!(error = %e, "failed to persist tracked processes");
        }
    }

    pub fn state_file(&self) -> Option<PathBuf> {
        self.inner.state_dir.as_ref().map(|d| d.join(TRACKED_FILE))
    }

    fn live_pid(&self, name: &str) -> Option<u32> {
        let pid = self
            .lock_tracked()
            .get(name)
            .filter(|t| t.state == SupervisionState::Running && t.pid > 0)
            .map(|t| t.pid)?;
        self.inner.controller.is_alive(pid).then_some(pid)
    }

    /// Starts the process unless it already runs. A new start clears the
    /// restart history for the name.
    pub async fn start_process(&self, params: StartParams) -> Result<StartReport, ProcessError> {
        let name = params.name();
        let lock = self.inner.policy.name_lock(&name);
        let _guard = lock.lock().await;

        if let Some(pid) = self.live_pid(&name) {
            return Ok(StartReport::AlreadyRunning(pid));
        }
        if let Some(pid) = self.inner.controller.discover(&params) {
            tracing::info!(%name, pid, "adopting already-running process");
            let entry = TrackedProcess::declared_silent(params, pid);
            self.announce_start(&entry, true);
            self.insert(entry);
            self.persist().await;
            return Ok(StartReport::AlreadyRunning(pid));
        }

        let pid = self.inner.controller.start(&params).await?;
        self.inner.policy.reset(&name);

        let mut entry = TrackedProcess::observed(params, pid);
        entry.last_pid = self.get(&name).map(|t| t.last_pid).unwrap_or(0);
        self.insert(entry.clone());
        self.announce_start(&entry, false);
        self.persist().await;
        Ok(StartReport::Started(pid))
    }

    /// Stops the process. The entry is marked stopped before any signal so
    /// the monitor never mistakes the exit for a crash. With auto-restart
    /// enabled the entry stays (PID 0) so a later external start is still
    /// supervised; otherwise it is dropped.
    pub async fn stop_process(
        &self,
        params: &StartParams,
        timeout: Duration,
    ) -> Result<StopReport, ProcessError> {
        let name = params.name();
        let lock = self.inner.policy.name_lock(&name);
        let _guard = lock.lock().await;

        let marked = self.update(&name, |t| {
            let prev = t.state;
            t.state = SupervisionState::StoppedIntentionally;
            (t.pid, prev, t.clone())
        });

        let (pid, prev_state, entry) = match marked {
            Some((pid, prev, entry)) => (pid, Some(prev), entry),
            None => {
                // Untracked: only act on a process we can find.
                let Some(pid) = self.inner.controller.discover(params) else {
                    return Ok(StopReport::AlreadyStopped);
                };
                (pid, None, TrackedProcess::declared_silent(params.clone(), pid))
            }
        };

        let outcome = if pid == 0 {
            StopOutcome::AlreadyStopped
        } else {
            match self.inner.controller.stop(pid, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(prev) = prev_state
                        && self.inner.controller.is_alive(pid)
                    {
                        self.update(&name, |t| t.state = prev);
                    }
                    return Err(e);
                }
            }
        };

        if prev_state.is_some() {
            if self.inner.policy.is_enabled() {
                self.update(&name, |t| {
                    if t.pid > 0 {
                        t.last_pid = t.pid;
                    }
                    t.pid = 0;
                });
            } else {
                self.lock_tracked().remove(&name);
            }
            self.persist().await;
        }

        match outcome {
            StopOutcome::AlreadyStopped => Ok(StopReport::AlreadyStopped),
            outcome => {
                let detail = if outcome == StopOutcome::Killed { "killed" } else { "terminated" };
                self.emit(
                    self.event_for(ProcessEventType::Stopped, &entry, pid)
                        .with_detail("outcome", detail),
                );
                Ok(StopReport::Stopped { pid, outcome })
            }
        }
    }

    /// Stop (tolerating an already stopped process) then start.
    pub async fn restart_process(
        &self,
        params: StartParams,
        timeout: Duration,
    ) -> Result<u32, ProcessError> {
        let name = params.name();
        let lock = self.inner.policy.name_lock(&name);
        let _guard = lock.lock().await;

        let marked = self.update(&name, |t| {
            let prev = t.state;
            t.state = SupervisionState::StoppedIntentionally;
            (t.pid, prev)
        });
        let old_pid = match marked {
            Some((pid, _)) if pid > 0 => pid,
            _ => self.inner.controller.discover(&params).unwrap_or(0),
        };
        if old_pid > 0
            && let Err(e) = self.inner.controller.stop(old_pid, timeout).await
        {
            // The old process may still be up; keep supervising it.
            if let Some((_, prev)) = marked
                && self.inner.controller.is_alive(old_pid)
            {
                self.update(&name, |t| t.state = prev);
            }
            return Err(e);
        }

        let entry = TrackedProcess::observed(params.clone(), 0);
        match self.inner.controller.start(&params).await {
            Ok(pid) => {
                self.inner.policy.reset(&name);
                let mut entry = TrackedProcess::observed(params, pid);
                entry.last_pid = old_pid;
                let event = self
                    .event_for(ProcessEventType::Restarted, &entry, pid)
                    .with_detail("previous_pid", old_pid.to_string())
                    .with_detail("trigger", "command");
                self.insert(entry);
                self.emit(event);
                self.persist().await;
                Ok(pid)
            }
            Err(e) => {
                let mut stopped = entry.clone();
                stopped.state = SupervisionState::StoppedIntentionally;
                stopped.last_pid = old_pid;
                self.insert(stopped);
                self.emit(
                    self.event_for(ProcessEventType::RestartFailed, &entry, old_pid)
                        .with_detail("reason", e.to_string())
                        .with_detail("trigger", "command"),
                );
                self.persist().await;
                Err(e)
            }
        }
    }

    /// Tracks a process reported by the coordinator without announcing it.
    /// A live PID is adopted as running; otherwise the entry waits with
    /// PID 0 for discovery. Returns whether the process is running.
    pub async fn track_silently(&self, params: StartParams, pid: u32) -> bool {
        let name = params.name();
        let lock = self.inner.policy.name_lock(&name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.live_pid(&name) {
            self.update(&name, |t| t.params = params);
            tracing::debug!(%name, pid = existing, "already tracked and running");
            return true;
        }

        let alive = pid > 0 && self.inner.controller.is_alive(pid);
        let pid = if alive {
            pid
        } else {
            self.inner.controller.discover(&params).unwrap_or(0)
        };
        self.insert(TrackedProcess::declared_silent(params, pid));
        pid > 0
    }

    /// Crash path, entered by the monitor after it flipped the entry to
    /// crashed. Emits `crashed`, then lets the policy decide.
    pub(crate) fn handle_crash(&self, entry: &TrackedProcess, dead_pid: u32) {
        self.emit(self.event_for(ProcessEventType::Crashed, entry, dead_pid));

        let decision = self
            .inner
            .policy
            .decide(&entry.name, tokio::time::Instant::now());
        match decision {
            RestartDecision::Disabled => {
                tracing::info!(name = %entry.name, "auto-restart disabled; leaving process down");
            }
            RestartDecision::InCooldown { remaining } => {
                tracing::warn!(name = %entry.name, remaining_secs = remaining.as_secs(), "restart skipped: in cooldown");
                self.emit(
                    self.event_for(ProcessEventType::RestartFailed, entry, dead_pid)
                        .with_detail("reason", "in cooldown")
                        .with_detail("cooldown_remaining_secs", remaining.as_secs().to_string()),
                );
            }
            RestartDecision::RateLimited { cooldown } => {
                tracing::warn!(name = %entry.name, cooldown_secs = cooldown.as_secs(), "restart rate limit exceeded");
                self.emit(
                    self.event_for(ProcessEventType::RestartFailed, entry, dead_pid)
                        .with_detail("reason", "rate limit exceeded")
                        .with_detail("cooldown_secs", cooldown.as_secs().to_string()),
                );
            }
            RestartDecision::Attempt { attempt, delay } => {
                self.update(&entry.name, |t| {
                    if t.state == SupervisionState::Crashed {
                        t.state = SupervisionState::Restarting;
                    }
                });
                tracing::info!(name = %entry.name, attempt, delay_secs = delay.as_secs(), "scheduling restart");
                let this = self.clone();
                let name = entry.name.clone();
                self.inner.restarts.spawn(async move {
                    this.run_restart_attempt(name, dead_pid, attempt, delay).await;
                });
            }
        }
    }

    async fn run_restart_attempt(&self, name: String, dead_pid: u32, attempt: u32, delay: Duration) {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let lock = self.inner.policy.name_lock(&name);
        let _guard = lock.lock().await;

        if !self.inner.policy.is_enabled() {
            self.update(&name, |t| {
                if t.state == SupervisionState::Restarting {
                    t.state = SupervisionState::Crashed;
                }
            });
            tracing::info!(%name, "auto-restart disabled during delay; restart abandoned");
            return;
        }

        // A stop or start may have superseded this attempt while it waited.
        let pending = self
            .lock_tracked()
            .get(&name)
            .filter(|t| t.state == SupervisionState::Restarting)
            .cloned();
        let Some(entry) = pending else {
            tracing::debug!(%name, "restart superseded");
            return;
        };

        match self.inner.controller.start(&entry.params).await {
            Ok(pid) => {
                self.update(&name, |t| {
                    t.pid = pid;
                    t.state = SupervisionState::Running;
                });
                self.emit(
                    self.event_for(ProcessEventType::Restarted, &entry, pid)
                        .with_detail("attempt", attempt.to_string())
                        .with_detail("previous_pid", dead_pid.to_string())
                        .with_detail("trigger", "auto_restart"),
                );
            }
            Err(e) => {
                self.update(&name, |t| t.state = SupervisionState::Crashed);
                tracing::warn!(%name, attempt, error = %e, "auto-restart failed");
                self.emit(
                    self.event_for(ProcessEventType::RestartFailed, &entry, dead_pid)
                        .with_detail("attempt", attempt.to_string())
                        .with_detail("reason", e.to_string()),
                );
            }
        }
        self.persist().await;
    }

    /// Stops the monitor and waits for pending restart attempts. Supervised
    /// processes keep running.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.cancel.cancel();
        self.inner.restarts.close();
        if tokio::time::timeout(timeout, self.inner.restarts.wait())
            .await
            .is_err()
        {
            tracing::warn!("restart attempts still pending at shutdown");
        }
        self.persist().await;
    }
}
