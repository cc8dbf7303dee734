use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use fleet_process::RestartConfig;
use tokio::io::AsyncWriteExt;

const DEFAULT_CONFIG_PATH: &str = "/etc/fleet-agent/agent.toml";
const OVERRIDES_FILE: &str = "runtime-overrides.json";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    match env_string(name)?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// External installer executable; `None` disables the install command.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_secs: 30 * 60,
        }
    }
}

/// Static agent configuration, loaded from TOML with `FLEET_*` env overrides.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    /// Coordinator address set, tried in order.
    pub coordinator_urls: Vec<String>,
    pub token: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub connection_check_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub command_retry_delay_ms: u64,
    pub state_dir: PathBuf,
    pub max_cached_events: usize,
    pub shutdown_timeout_secs: u64,
    pub process_start_timeout_secs: u64,
    pub process_stop_timeout_secs: u64,
    pub restart: RestartConfig,
    pub installer: InstallerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            coordinator_urls: Vec::new(),
            token: None,
            heartbeat_interval_secs: 10,
            monitor_interval_secs: 5,
            connection_check_interval_secs: 10,
            connect_timeout_secs: 10,
            rpc_timeout_secs: 30,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 60_000,
            command_retry_delay_ms: 5000,
            state_dir: PathBuf::from("/var/lib/fleet-agent"),
            max_cached_events: 1000,
            shutdown_timeout_secs: 10,
            process_start_timeout_secs: 60,
            process_stop_timeout_secs: 30,
            restart: RestartConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

fn default_node_name() -> String {
    env_string("HOSTNAME")
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| "default".to_string())
}

pub(crate) fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Support http(s) URLs by converting to ws(s).
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

impl AgentConfig {
    pub fn config_path() -> PathBuf {
        env_string("FLEET_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Loads the TOML file (missing file = defaults), then env overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
        };
        cfg.apply_env();
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let mut cfg: Self = toml::from_str(text)?;
        cfg.normalize();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("FLEET_NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = env_string("FLEET_COORDINATOR_URLS") {
            self.coordinator_urls = v.split(',').map(|s| s.to_string()).collect();
        }
        if let Some(v) = env_string("FLEET_NODE_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = env_u64("FLEET_HEARTBEAT_INTERVAL_SEC") {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = env_u64("FLEET_MONITOR_INTERVAL_SEC") {
            self.monitor_interval_secs = v;
        }
        if let Some(v) = env_u64("FLEET_RPC_TIMEOUT_SEC") {
            self.rpc_timeout_secs = v;
        }
        if let Some(v) = env_string("FLEET_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env_u64("FLEET_MAX_CACHED_EVENTS") {
            self.max_cached_events = v as usize;
        }
        if let Some(v) = env_bool("FLEET_AUTO_RESTART") {
            self.restart.enabled = v;
        }
        if let Some(v) = env_string("FLEET_INSTALLER") {
            self.installer.program = Some(PathBuf::from(v));
        }
    }

    fn normalize(&mut self) {
        self.coordinator_urls = self
            .coordinator_urls
            .iter()
            .filter_map(|u| parse_ws_url(u))
            .collect();
        self.node_name = self.node_name.trim().to_string();
        if self.node_name.is_empty() {
            self.node_name = default_node_name();
        }
        self.heartbeat_interval_secs = self.heartbeat_interval_secs.clamp(1, 3600);
        self.monitor_interval_secs = self.monitor_interval_secs.clamp(1, 600);
        self.connection_check_interval_secs = self.connection_check_interval_secs.clamp(1, 600);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 300);
        self.rpc_timeout_secs = self.rpc_timeout_secs.clamp(1, 600);
        self.reconnect_min_ms = self.reconnect_min_ms.clamp(100, 60_000);
        self.reconnect_max_ms = self.reconnect_max_ms.clamp(self.reconnect_min_ms, 60 * 60_000);
        self.command_retry_delay_ms = self.command_retry_delay_ms.clamp(100, 60_000);
        self.max_cached_events = self.max_cached_events.clamp(1, 1_000_000);
        self.shutdown_timeout_secs = self.shutdown_timeout_secs.clamp(1, 300);
        self.process_start_timeout_secs = self.process_start_timeout_secs.clamp(1, 3600);
        self.process_stop_timeout_secs = self.process_stop_timeout_secs.clamp(1, 3600);
        self.installer.timeout_secs = self.installer.timeout_secs.clamp(1, 24 * 3600);
        self.restart = self.restart.clamped();
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn process_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.process_stop_timeout_secs)
    }

    pub fn process_start_timeout(&self) -> Duration {
        Duration::from_secs(self.process_start_timeout_secs)
    }

    /// Layers coordinator-pushed overrides over the static values.
    pub fn apply_overrides(&mut self, o: &RuntimeOverrides) {
        if let Some(v) = o.heartbeat_interval_secs {
            self.heartbeat_interval_secs = v.clamp(1, 3600);
        }
        if let Some(v) = o.monitor_interval_secs {
            self.monitor_interval_secs = v.clamp(1, 600);
        }
        if let Some(r) = o.restart {
            self.restart = r.clamped();
        }
    }
}

/// What the coordinator told us, kept apart from the operator's config file.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartConfig>,
}

/// JSON file under the state dir holding [`RuntimeOverrides`].
#[derive(Debug)]
pub struct OverrideStore {
    dir: PathBuf,
    current: tokio::sync::Mutex<RuntimeOverrides>,
}

impl OverrideStore {
    pub fn path(&self) -> PathBuf {
        self.dir.join(OVERRIDES_FILE)
    }

    /// Opens the store; an unreadable or corrupt file is logged and ignored.
    pub async fn open(dir: &Path) -> Self {
        let path = dir.join(OVERRIDES_FILE);
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RuntimeOverrides>(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt runtime overrides");
                    RuntimeOverrides::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RuntimeOverrides::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read runtime overrides");
                RuntimeOverrides::default()
            }
        };
        Self {
            dir: dir.to_path_buf(),
            current: tokio::sync::Mutex::new(current),
        }
    }

    pub async fn get(&self) -> RuntimeOverrides {
        self.current.lock().await.clone()
    }

    /// Applies `f` and persists the result. The in-memory value only changes
    /// once the file write succeeded.
    pub async fn update<F>(&self, f: F) -> anyhow::Result<RuntimeOverrides>
    where
        F: FnOnce(&mut RuntimeOverrides),
    {
        let mut guard = self.current.lock().await;
        let mut next = guard.clone();
        f(&mut next);
        if next == *guard {
            return Ok(next);
        }
        write_json_atomic(&self.dir, OVERRIDES_FILE, &next).await?;
        *guard = next.clone();
        Ok(next)
    }
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    name: &str,
    value: &T,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create state dir {}", dir.display()))?;
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let data = serde_json::to_vec_pretty(value).with_context(|| format!("serialize {name}"))?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {name}.tmp"))?;
    f.write_all(&data).await.with_context(|| format!("write {name}.tmp"))?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("persist {name}"))?;
    Ok(())
}
