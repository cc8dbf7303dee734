//! The node supervisor root: wires the connection, the process supervisor,
//! the event reporter and the command router together and owns the
//! background loops.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use fleet_proto::coordinator_v1::{ProcessStatus, RegisterRequest, RuntimeConfig};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    command::{
        CommandRouter,
        handlers::{HandlerContext, register_builtin},
        install::{Installer, ProgramInstaller},
    },
    config::{AgentConfig, OverrideStore, RuntimeOverrides},
    connection::{
        CommandHandler, ConnectionManager, ConnectionSettings, ConnectionState, Dialer, WsDialer,
    },
    error::RpcError,
    events::EventReporter,
    metrics::MetricsCollector,
    process::{OsProcessController, ProcessController, ProcessSupervisor},
};

/// Replaceable collaborators. `Agent::new` fills them with the production
/// implementations.
pub struct AgentParts {
    pub settings: ConnectionSettings,
    pub dialer: Arc<dyn Dialer>,
    pub controller: Arc<dyn ProcessController>,
    pub installer: Option<Arc<dyn Installer>>,
    pub overrides: OverrideStore,
}

struct AgentInner {
    config: AgentConfig,
    connection: ConnectionManager,
    supervisor: ProcessSupervisor,
    reporter: EventReporter,
    router: Arc<CommandRouter>,
    metrics: Arc<MetricsCollector>,
    overrides: Arc<OverrideStore>,
    installer: Option<Arc<dyn Installer>>,
    heartbeat_interval: Arc<watch::Sender<Duration>>,
    cancel: CancellationToken,
    loops: TaskTracker,
    commands: TaskTracker,
    register_lock: tokio::sync::Mutex<()>,
    /// Session epoch whose registration the coordinator refused.
    rejected_epoch: Mutex<Option<u64>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("node", &self.inner.config.node_name)
            .field("connection", &self.inner.connection)
            .finish()
    }
}

impl Agent {
    /// Builds the production agent. Runtime overrides persisted by earlier
    /// runs are layered over `config` here.
    pub async fn new(mut config: AgentConfig) -> anyhow::Result<Self> {
        let overrides = OverrideStore::open(&config.state_dir).await;
        let current = overrides.get().await;
        if current != RuntimeOverrides::default() {
            tracing::info!(path = %overrides.path().display(), "applying persisted runtime overrides");
            config.apply_overrides(&current);
        }

        let installer = ProgramInstaller::from_config(&config.installer)
            .map(|i| Arc::new(i) as Arc<dyn Installer>);
        if installer.is_none() {
            tracing::info!("no installer configured; install commands will fail");
        }

        let parts = AgentParts {
            settings: ConnectionSettings::from_config(&config),
            dialer: Arc::new(WsDialer::new(config.token.clone())),
            controller: Arc::new(OsProcessController::new(config.process_start_timeout())),
            installer,
            overrides,
        };
        Ok(Self::with_parts(config, parts))
    }

    pub fn with_parts(config: AgentConfig, parts: AgentParts) -> Self {
        let connection = ConnectionManager::new(parts.settings, parts.dialer);
        let supervisor = ProcessSupervisor::new(
            parts.controller,
            config.restart,
            config.monitor_interval(),
            Some(config.state_dir.clone()),
        );
        let reporter = EventReporter::new(
            connection.clone(),
            config.max_cached_events,
            Duration::from_millis(config.command_retry_delay_ms),
        );
        let (heartbeat_interval, _) = watch::channel(config.heartbeat_interval());

        Self {
            inner: Arc::new(AgentInner {
                metrics: Arc::new(MetricsCollector::new(config.state_dir.clone())),
                overrides: Arc::new(parts.overrides),
                installer: parts.installer,
                connection,
                supervisor,
                reporter,
                router: Arc::new(CommandRouter::new()),
                heartbeat_interval: Arc::new(heartbeat_interval),
                cancel: CancellationToken::new(),
                loops: TaskTracker::new(),
                commands: TaskTracker::new(),
                register_lock: tokio::sync::Mutex::new(()),
                rejected_epoch: Mutex::new(None),
                monitor_task: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub fn reporter(&self) -> &EventReporter {
        &self.inner.reporter
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.inner.router
    }

    pub fn heartbeat_interval(&self) -> Duration {
        *self.inner.heartbeat_interval.borrow()
    }

    /// Runs the startup sequence. Only an unusable process table is fatal;
    /// coordinator trouble is left to the background loops.
    pub async fn start(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let adopted = inner
            .supervisor
            .start()
            .await
            .context("start process supervisor")?;
        tracing::info!(adopted, "process supervisor started");

        let reporter = inner.reporter.clone();
        inner
            .supervisor
            .set_event_callback(Arc::new(move |event| reporter.report(event)));
        inner.reporter.start();
        let monitor = inner.supervisor.spawn_monitor();
        *inner.monitor_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(monitor);

        register_builtin(
            &inner.router,
            HandlerContext {
                supervisor: inner.supervisor.clone(),
                metrics: inner.metrics.clone(),
                overrides: inner.overrides.clone(),
                heartbeat_interval: inner.heartbeat_interval.clone(),
                stop_timeout: inner.config.process_stop_timeout(),
                installer: inner.installer.clone(),
            },
        );
        tracing::debug!(types = ?inner.router.command_types(), "command handlers registered");

        inner
            .connection
            .connect(inner.config.connect_timeout())
            .await?;
        if inner.connection.is_connected()
            && let Err(e) = self.register().await
        {
            tracing::warn!(error = %e, "initial registration failed");
        }

        let node = inner.config.node_name.clone();
        inner.loops.spawn({
            let this = self.clone();
            async move { this.heartbeat_loop().await }
                .instrument(tracing::info_span!("heartbeat", node = %node))
        });
        inner.loops.spawn({
            let this = self.clone();
            async move { this.command_stream_loop().await }
                .instrument(tracing::info_span!("command_stream", node = %node))
        });
        inner.loops.spawn({
            let this = self.clone();
            async move { this.connection_monitor_loop().await }
                .instrument(tracing::info_span!("connection_monitor", node = %node))
        });
        tracing::info!(node = %node, "agent started");
        Ok(())
    }

    fn rejected_for(&self, epoch: u64) -> bool {
        *self
            .inner
            .rejected_epoch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            == Some(epoch)
    }

    /// Registers unless already registered. Serialized so the loops never
    /// register twice for one session.
    async fn register(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        let _guard = inner.register_lock.lock().await;
        let status = inner.connection.status();
        if status.is_ready() {
            return Ok(());
        }
        if self.rejected_for(status.epoch) {
            return Err(RpcError::Fatal(
                "registration rejected for this session".to_string(),
            ));
        }

        let req = RegisterRequest {
            node_name: inner.config.node_name.clone(),
            agent_id: String::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            system_info: Some(inner.metrics.system_info()),
            labels: HashMap::new(),
        };
        let resp = match inner.connection.register(req).await {
            Ok(resp) => resp,
            Err(e) => {
                if matches!(e, RpcError::Fatal(_)) {
                    tracing::error!(error = %e, epoch = status.epoch, "coordinator rejected registration");
                    *inner
                        .rejected_epoch
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(status.epoch);
                }
                return Err(e);
            }
        };
        if let Some(rc) = resp.runtime_config {
            self.apply_runtime_config(rc).await;
        }
        Ok(())
    }

    /// Applies and persists coordinator-pushed settings. Zero means "keep".
    async fn apply_runtime_config(&self, rc: RuntimeConfig) {
        let inner = &self.inner;
        let heartbeat = (rc.heartbeat_interval_secs > 0)
            .then(|| u64::from(rc.heartbeat_interval_secs).clamp(1, 3600));
        let monitor = (rc.monitor_interval_secs > 0)
            .then(|| u64::from(rc.monitor_interval_secs).clamp(1, 600));
        if heartbeat.is_none() && monitor.is_none() {
            return;
        }

        let persisted = inner
            .overrides
            .update(|o| {
                if heartbeat.is_some() {
                    o.heartbeat_interval_secs = heartbeat;
                }
                if monitor.is_some() {
                    o.monitor_interval_secs = monitor;
                }
            })
            .await;
        if let Err(e) = persisted {
            tracing::warn!(error = %e, "failed to persist runtime config; applying in memory only");
        }

        if let Some(secs) = heartbeat {
            let next = Duration::from_secs(secs);
            inner.heartbeat_interval.send_if_modified(|cur| {
                let changed = *cur != next;
                *cur = next;
                changed
            });
        }
        if let Some(secs) = monitor {
            inner.supervisor.set_monitor_interval(Duration::from_secs(secs));
        }
        tracing::info!(
            heartbeat_interval_secs = ?heartbeat,
            monitor_interval_secs = ?monitor,
            "applied coordinator runtime config"
        );
    }

    async fn process_statuses(&self) -> Vec<ProcessStatus> {
        let metrics = &self.inner.metrics;
        let mut out = Vec::new();
        let mut live = Vec::new();
        for t in self.inner.supervisor.snapshot() {
            let stats = metrics.process_stats(t.pid).await.unwrap_or_default();
            if t.pid > 0 {
                live.push(t.pid);
            }
            out.push(ProcessStatus {
                name: t.name,
                pid: t.pid,
                status: t.state.as_str().to_string(),
                cpu_percent: stats.cpu_percent,
                memory_bytes: stats.rss_bytes,
            });
        }
        metrics.retain_pids(&live);
        out
    }

    async fn heartbeat_tick(&self) {
        let conn = &self.inner.connection;
        if !conn.is_connected() {
            tracing::debug!("skipping heartbeat; not connected");
            return;
        }
        if !conn.is_registered()
            && let Err(e) = self.register().await
        {
            tracing::warn!(error = %e, "skipping heartbeat; registration failed");
            return;
        }

        let usage = self.inner.metrics.host_usage().await;
        let processes = self.process_statuses().await;
        match conn.send_heartbeat(usage, processes).await {
            Ok(()) => tracing::debug!("heartbeat sent"),
            Err(e) if e.is_not_registered() => {
                tracing::warn!(error = %e, "coordinator lost our registration; re-registering");
                match self.register().await {
                    Ok(()) => tracing::info!(agent_id = ?conn.agent_id(), "re-registered with coordinator"),
                    Err(e) => tracing::warn!(error = %e, "re-registration failed"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
        }
    }

    async fn heartbeat_loop(&self) {
        let cancel = self.inner.cancel.clone();
        let mut interval = self.inner.heartbeat_interval.subscribe();
        loop {
            let period = *interval.borrow_and_update();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!(interval_ms = interval.borrow().as_millis() as u64, "heartbeat interval changed");
                    continue;
                }
                _ = tokio::time::sleep(period) => {}
            }
            self.heartbeat_tick().await;
        }
        tracing::debug!("heartbeat loop stopped");
    }

    async fn command_stream_loop(&self) {
        let inner = &self.inner;
        let cancel = inner.cancel.clone();
        let mut link = inner.connection.subscribe();
        let retry = Duration::from_millis(inner.config.command_retry_delay_ms);
        let handler: Arc<dyn CommandHandler> = inner.router.clone();
        loop {
            if !link.borrow_and_update().is_ready() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = link.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            match inner
                .connection
                .start_command_stream(&cancel, &inner.commands, handler.clone())
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, retry_ms = retry.as_millis() as u64, "command stream ended");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
        }
        tracing::debug!("command stream loop stopped");
    }

    async fn connection_monitor_loop(&self) {
        let inner = &self.inner;
        let cancel = inner.cancel.clone();
        let mut link = inner.connection.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            inner.config.connection_check_interval_secs,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let status = *link.borrow_and_update();
            match status.state {
                ConnectionState::Disconnected if inner.connection.has_coordinator() => {
                    if inner.connection.spawn_reconnect() {
                        tracing::info!("coordinator unreachable; reconnecting in background");
                    }
                }
                ConnectionState::Connected if !status.registered => {
                    if self.rejected_for(status.epoch) {
                        continue;
                    }
                    if let Err(e) = self.register().await {
                        tracing::warn!(error = %e, "registration failed");
                    }
                }
                _ => {}
            }
        }
        tracing::debug!("connection monitor stopped");
    }

    /// Stops the agent. Supervised processes are left running so an agent
    /// restart or upgrade does not disturb the workload.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let timeout = Duration::from_secs(inner.config.shutdown_timeout_secs);
        let step = timeout / 2;
        tracing::info!(timeout_secs = timeout.as_secs(), "agent shutting down");

        inner.cancel.cancel();
        inner.loops.close();
        inner.commands.close();

        inner.supervisor.shutdown(step).await;
        let monitor = inner
            .monitor_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor
            && tokio::time::timeout(step, handle).await.is_err()
        {
            tracing::warn!("process monitor did not stop in time");
        }

        inner.reporter.stop(step).await;
        inner.connection.close().await;

        let joined = tokio::time::timeout(timeout, async {
            inner.loops.wait().await;
            inner.commands.wait().await;
        })
        .await;
        if joined.is_err() {
            tracing::warn!("background tasks still running at shutdown deadline");
        }
        tracing::info!("agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeController, FakeCoordinator, test_settings};
    use fleet_process::DeploymentMode;
    use fleet_proto::coordinator_v1::CommandStatus;

    use crate::process::StartParams;

    struct Fixture {
        agent: Agent,
        coord: FakeCoordinator,
        controller: Arc<FakeController>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(coord: FakeCoordinator) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            node_name: "node-test".to_string(),
            state_dir: dir.path().to_path_buf(),
            command_retry_delay_ms: 100,
            ..AgentConfig::default()
        };
        let controller = Arc::new(FakeController::new());
        let parts = AgentParts {
            settings: test_settings(),
            dialer: Arc::new(coord.clone()),
            controller: controller.clone(),
            installer: None,
            overrides: OverrideStore::open(dir.path()).await,
        };
        let agent = Agent::with_parts(config, parts);
        agent
            .inner
            .heartbeat_interval
            .send_replace(Duration::from_millis(50));
        Fixture {
            agent,
            coord,
            controller,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn lost_registration_is_restored_by_the_heartbeat() {
        let f = fixture(FakeCoordinator::new()).await;
        f.agent.start().await.unwrap();
        assert!(f.agent.connection().is_registered());
        f.coord.wait_for_heartbeats(1).await;

        f.coord.forget_agents();
        f.coord.wait_for_registrations(2).await;
        let before = f.coord.heartbeats();
        f.coord.wait_for_heartbeats(before + 1).await;
        assert_eq!(f.agent.connection().agent_id().as_deref(), Some("agent-2"));

        f.agent.shutdown().await;
    }

    #[tokio::test]
    async fn coordinator_runtime_config_is_applied_and_persisted() {
        let coord = FakeCoordinator::new();
        coord.set_runtime_config(RuntimeConfig {
            heartbeat_interval_secs: 7,
            monitor_interval_secs: 3,
        });
        let f = fixture(coord).await;
        f.agent.start().await.unwrap();

        assert_eq!(f.agent.heartbeat_interval(), Duration::from_secs(7));
        assert_eq!(
            f.agent.supervisor().monitor().interval(),
            Duration::from_secs(3)
        );
        let stored = f.agent.inner.overrides.get().await;
        assert_eq!(stored.heartbeat_interval_secs, Some(7));
        assert_eq!(stored.monitor_interval_secs, Some(3));

        f.agent.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_coordinator_does_not_block_startup() {
        let coord = FakeCoordinator::new();
        coord.set_reachable(false);
        let f = fixture(coord).await;
        f.agent.start().await.unwrap();
        assert!(!f.agent.connection().is_connected());

        f.coord.set_reachable(true);
        f.coord.wait_for_registrations(1).await;
        f.coord.wait_for_heartbeats(1).await;

        f.agent.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_registration_is_not_fatal() {
        let coord = FakeCoordinator::new();
        coord.reject_registration("node not allowed");
        let f = fixture(coord).await;
        f.agent.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!f.agent.connection().is_registered());
        assert_eq!(f.coord.registrations(), 0);
        assert_eq!(f.coord.heartbeats(), 0);

        f.agent.shutdown().await;
    }

    #[tokio::test]
    async fn start_command_produces_result_and_event() {
        let f = fixture(FakeCoordinator::new()).await;
        f.agent.start().await.unwrap();
        f.coord.wait_for_stream_open().await;

        f.coord.push_command(
            "c-1",
            "start",
            &[
                ("install_dir", "/opt/seatunnel"),
                ("deployment_mode", "separated"),
                ("role", "worker"),
            ],
        );
        let updates = f.coord.updates_until_terminal().await;
        let last = updates.last().unwrap();
        assert_eq!(last.status(), CommandStatus::Completed);
        assert!(last.output.contains("seatunnel-worker"));

        let events = f.coord.wait_for_events(1).await;
        assert_eq!(events[0].event_type, "started");
        assert_eq!(events[0].process_name, "seatunnel-worker");
        assert_eq!(events[0].role, "worker");

        f.agent.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_supervised_processes_running() {
        let f = fixture(FakeCoordinator::new()).await;
        f.agent.start().await.unwrap();
        let report = f
            .agent
            .supervisor()
            .start_process(StartParams::new("/opt/seatunnel", DeploymentMode::Hybrid, ""))
            .await
            .unwrap();

        f.agent.shutdown().await;
        assert_eq!(f.controller.stops(), 0);
        assert!(f.controller.is_alive(report.pid()));
        assert!(!f.agent.connection().is_connected());
    }
}
