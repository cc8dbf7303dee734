//! Built-in command handlers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use fleet_proto::coordinator_v1::Command;
use serde_json::json;
use tokio::sync::watch;

use super::{
    CommandRouter, Handler, ProgressSink,
    install::{InstallRequest, Installer},
};
use crate::{
    config::OverrideStore,
    metrics::MetricsCollector,
    process::{ProcessSupervisor, StartParams, StartReport, StopReport},
};

pub mod types {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const RESTART: &str = "restart";
    pub const STATUS: &str = "status";
    pub const SYNC_PROCESSES: &str = "sync_processes";
    pub const INSTALL: &str = "install";
    pub const UPDATE_RESTART_CONFIG: &str = "update_restart_config";
    pub const UPDATE_CONFIG: &str = "update_config";
}

/// What the built-in handlers operate on.
#[derive(Clone)]
pub struct HandlerContext {
    pub supervisor: ProcessSupervisor,
    pub metrics: Arc<MetricsCollector>,
    pub overrides: Arc<OverrideStore>,
    pub heartbeat_interval: Arc<watch::Sender<Duration>>,
    pub stop_timeout: Duration,
    pub installer: Option<Arc<dyn Installer>>,
}

pub fn register_builtin(router: &CommandRouter, ctx: HandlerContext) {
    let ctx = Arc::new(ctx);
    router.register_handler(types::START, Arc::new(Start(ctx.clone())));
    router.register_handler(types::STOP, Arc::new(Stop(ctx.clone())));
    router.register_handler(types::RESTART, Arc::new(Restart(ctx.clone())));
    router.register_handler(types::STATUS, Arc::new(Status(ctx.clone())));
    router.register_handler(types::SYNC_PROCESSES, Arc::new(SyncProcesses(ctx.clone())));
    router.register_handler(types::INSTALL, Arc::new(Install(ctx.clone())));
    router.register_handler(
        types::UPDATE_RESTART_CONFIG,
        Arc::new(UpdateRestartConfig(ctx.clone())),
    );
    router.register_handler(types::UPDATE_CONFIG, Arc::new(UpdateConfig(ctx)));
}

fn stop_timeout(params: &HashMap<String, String>, default: Duration) -> anyhow::Result<Duration> {
    match params.get("timeout_secs") {
        Some(v) => {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("invalid timeout_secs: {v:?}"))?;
            Ok(Duration::from_secs(secs.clamp(1, 3600)))
        }
        None => Ok(default),
    }
}

struct Start(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for Start {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        let params = StartParams::from_params(&command.parameters)?;
        let name = params.name();
        progress.report(10, format!("starting {name}"));
        match self.0.supervisor.start_process(params).await? {
            StartReport::Started(pid) => Ok(format!("started {name} (pid {pid})")),
            StartReport::AlreadyRunning(pid) => Ok(format!("{name} already running (pid {pid})")),
        }
    }
}

struct Stop(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for Stop {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        let params = StartParams::from_params(&command.parameters)?;
        let timeout = stop_timeout(&command.parameters, self.0.stop_timeout)?;
        let name = params.name();
        progress.report(10, format!("stopping {name}"));
        match self.0.supervisor.stop_process(&params, timeout).await? {
            StopReport::Stopped { pid, .. } => Ok(format!("stopped {name} (pid {pid})")),
            StopReport::AlreadyStopped => Ok(format!("{name} already stopped")),
        }
    }
}

struct Restart(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for Restart {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        let params = StartParams::from_params(&command.parameters)?;
        let timeout = stop_timeout(&command.parameters, self.0.stop_timeout)?;
        let name = params.name();
        progress.report(10, format!("restarting {name}"));
        let pid = self.0.supervisor.restart_process(params, timeout).await?;
        Ok(format!("restarted {name} (pid {pid})"))
    }
}

struct Status(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for Status {
    async fn run(&self, command: &Command, _progress: &ProgressSink) -> anyhow::Result<String> {
        let filter = command.parameters.get("name").map(|s| s.trim());
        let ctx = &self.0;

        let mut processes = Vec::new();
        for t in ctx.supervisor.snapshot() {
            if filter.is_some_and(|f| f != t.name) {
                continue;
            }
            let stats = ctx.metrics.process_stats(t.pid).await.unwrap_or_default();
            processes.push(json!({
                "name": t.name,
                "pid": t.pid,
                "last_pid": t.last_pid,
                "state": t.state.as_str(),
                "install_dir": t.params.install_dir,
                "deployment_mode": t.params.deployment_mode.as_str(),
                "role": t.params.role,
                "tracked_since": t.tracked_since.to_rfc3339(),
                "cpu_percent": stats.cpu_percent,
                "memory_bytes": stats.rss_bytes,
            }));
        }

        let usage = ctx.metrics.host_usage().await;
        let out = json!({
            "processes": processes,
            "auto_restart": ctx.supervisor.restart_config(),
            "monitor_interval_secs": ctx.supervisor.monitor().interval().as_secs(),
            "heartbeat_interval_secs": ctx.heartbeat_interval.borrow().as_secs(),
            "host": {
                "cpu_percent": usage.cpu_percent,
                "memory_percent": usage.memory_percent,
                "disk_percent": usage.disk_percent,
                "load_average_1m": usage.load_average_1m,
            },
        });
        Ok(serde_json::to_string_pretty(&out)?)
    }
}

/// One entry of the `processes` parameter of `sync_processes`.
#[derive(Debug, serde::Deserialize)]
struct SyncEntry {
    install_dir: String,
    #[serde(default)]
    deployment_mode: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    pid: u32,
}

impl SyncEntry {
    fn params(&self) -> anyhow::Result<StartParams> {
        let mut map = HashMap::new();
        map.insert("install_dir".to_string(), self.install_dir.clone());
        if let Some(v) = &self.deployment_mode {
            map.insert("deployment_mode".to_string(), v.clone());
        }
        if let Some(v) = &self.role {
            map.insert("role".to_string(), v.clone());
        }
        if let Some(v) = &self.process_name {
            map.insert("process_name".to_string(), v.clone());
        }
        Ok(StartParams::from_params(&map)?)
    }
}

/// Re-establishes tracking for processes the coordinator believes live on
/// this node. Nothing is started and no events are emitted.
struct SyncProcesses(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for SyncProcesses {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        let raw = command
            .parameters
            .get("processes")
            .context("processes is required")?;
        let entries: Vec<SyncEntry> =
            serde_json::from_str(raw).context("processes must be a JSON array")?;

        let total = entries.len().max(1) as u32;
        let mut running = Vec::new();
        let mut waiting = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let params = entry.params()?;
            let name = params.name();
            if self.0.supervisor.track_silently(params, entry.pid).await {
                running.push(name);
            } else {
                waiting.push(name);
            }
            progress.report((i as u32 + 1) * 100 / total, format!("synced {}", i + 1));
        }
        self.0.supervisor.persist().await;

        Ok(json!({ "running": running, "waiting": waiting }).to_string())
    }
}

struct Install(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for Install {
    async fn run(&self, command: &Command, progress: &ProgressSink) -> anyhow::Result<String> {
        let installer = self
            .0
            .installer
            .as_ref()
            .context("install is not configured on this node")?;
        let req = InstallRequest::from_params(&command.parameters)?;
        installer
            .install(&req, progress)
            .await
            .with_context(|| format!("install {}", req.version))
    }
}

/// Replaces the auto-restart configuration. The new values are persisted
/// before they take effect.
struct UpdateRestartConfig(Arc<HandlerContext>);

#[tonic::async_trait]
impl Handler for UpdateRestartConfig {
    async fn run(&self, command: &Command, _progress: &ProgressSink) -> anyhow::Result<String> {
        let next = self
            .0
            .supervisor
            .restart_config()
            .with_params(&command.parameters)
            .map_err(anyhow::Error::msg)?;
        self.0
            .overrides
            .update(|o| o.restart = Some(next))
            .await
            .context("persist restart config")?;
        self.0.supervisor.set_restart_config(next);
        Ok(serde_json::to_string(&next)?)
    }
}

/// Heartbeat and monitor intervals.
struct UpdateConfig(Arc<HandlerContext>);

fn parse_secs(params: &HashMap<String, String>, key: &str, max: u64) -> anyhow::Result<Option<u64>> {
    let Some(raw) = params.get(key) else {
        return Ok(None);
    };
    let v: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    anyhow::ensure!((1..=max).contains(&v), "{key} must be between 1 and {max}");
    Ok(Some(v))
}

#[tonic::async_trait]
impl Handler for UpdateConfig {
    async fn run(&self, command: &Command, _progress: &ProgressSink) -> anyhow::Result<String> {
        let heartbeat = parse_secs(&command.parameters, "heartbeat_interval_secs", 3600)?;
        let monitor = parse_secs(&command.parameters, "monitor_interval_secs", 600)?;
        anyhow::ensure!(
            heartbeat.is_some() || monitor.is_some(),
            "nothing to update: expected heartbeat_interval_secs or monitor_interval_secs"
        );

        let saved = self
            .0
            .overrides
            .update(|o| {
                if heartbeat.is_some() {
                    o.heartbeat_interval_secs = heartbeat;
                }
                if monitor.is_some() {
                    o.monitor_interval_secs = monitor;
                }
            })
            .await
            .context("persist runtime config")?;

        if let Some(secs) = heartbeat {
            self.0.heartbeat_interval.send_replace(Duration::from_secs(secs));
        }
        if let Some(secs) = monitor {
            self.0.supervisor.set_monitor_interval(Duration::from_secs(secs));
        }
        Ok(serde_json::to_string(&saved)?)
    }
}
