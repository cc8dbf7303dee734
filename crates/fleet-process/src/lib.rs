use std::{collections::BTreeMap, collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};

/// Logical name of the engine when no role suffix applies.
pub const DEFAULT_BASE_NAME: &str = "seatunnel";

/// Role values that mean "one process does everything".
const HYBRID_ROLES: &[&str] = &["hybrid", "master_and_worker", "master-and-worker"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    Hybrid,
    Separated,
}

impl DeploymentMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "hybrid" => Some(Self::Hybrid),
            "separated" | "separate" | "split" => Some(Self::Separated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Separated => "separated",
        }
    }
}

pub fn is_hybrid_role(role: &str) -> bool {
    let role = role.trim();
    role.is_empty() || HYBRID_ROLES.iter().any(|r| r.eq_ignore_ascii_case(role))
}

/// Tracking key for a process. This string joins commands, tracking and
/// events, so it must stay stable: hybrid deployments use the bare base name,
/// separated deployments append `-<role>` unless the role is a hybrid value.
pub fn process_name(base: &str, mode: DeploymentMode, role: &str) -> String {
    let base = match base.trim() {
        "" => DEFAULT_BASE_NAME,
        b => b,
    };
    match mode {
        DeploymentMode::Separated if !is_hybrid_role(role) => {
            format!("{base}-{}", role.trim().to_ascii_lowercase())
        }
        _ => base.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventType {
    Started,
    Stopped,
    Crashed,
    Restarted,
    RestartFailed,
}

impl ProcessEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Restarted => "restarted",
            Self::RestartFailed => "restart_failed",
        }
    }
}

/// Immutable process lifecycle record delivered to the coordinator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessEvent {
    pub id: uuid::Uuid,
    pub event_type: ProcessEventType,
    pub pid: u32,
    pub name: String,
    pub install_dir: String,
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

impl ProcessEvent {
    pub fn new(
        event_type: ProcessEventType,
        name: impl Into<String>,
        pid: u32,
        install_dir: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event_type,
            pid,
            name: name.into(),
            install_dir: install_dir.into(),
            role: role.into(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.details.get("reason").map(String::as_str)
    }
}

/// Supervision state of one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionState {
    Unknown,
    Running,
    Crashed,
    Restarting,
    StoppedIntentionally,
}

impl SupervisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::StoppedIntentionally => "stopped",
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Upper bound for every restart duration (one week).
pub const MAX_RESTART_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Process-wide auto-restart policy. `max_restarts` within `time_window` is a
/// sliding rate limit; exceeding it parks the process for `cooldown_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enabled: bool,
    #[serde(rename = "restart_delay_secs", with = "duration_secs")]
    pub restart_delay: Duration,
    pub max_restarts: u32,
    #[serde(rename = "time_window_secs", with = "duration_secs")]
    pub time_window: Duration,
    #[serde(rename = "cooldown_period_secs", with = "duration_secs")]
    pub cooldown_period: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_delay: Duration::from_secs(10),
            max_restarts: 3,
            time_window: Duration::from_secs(60),
            cooldown_period: Duration::from_secs(300),
        }
    }
}

impl RestartConfig {
    /// Caps the durations at `MAX_RESTART_DURATION`.
    pub fn clamped(mut self) -> Self {
        self.restart_delay = self.restart_delay.min(MAX_RESTART_DURATION);
        self.time_window = self.time_window.min(MAX_RESTART_DURATION);
        self.cooldown_period = self.cooldown_period.min(MAX_RESTART_DURATION);
        self
    }

    /// Applies string parameters on top of `self`. Unknown keys are ignored;
    /// malformed values reject the whole update.
    pub fn with_params(mut self, params: &HashMap<String, String>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
            raw.trim()
                .parse::<T>()
                .map_err(|_| format!("invalid value for {key}: {raw:?}"))
        }

        if let Some(v) = params.get("enabled") {
            self.enabled = match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => return Err(format!("invalid value for enabled: {v:?}")),
            };
        }
        if let Some(v) = params.get("restart_delay_secs") {
            self.restart_delay = Duration::from_secs(parse::<u64>("restart_delay_secs", v)?);
        }
        if let Some(v) = params.get("max_restarts") {
            self.max_restarts = parse::<u32>("max_restarts", v)?;
        }
        if let Some(v) = params.get("time_window_secs") {
            self.time_window = Duration::from_secs(parse::<u64>("time_window_secs", v)?);
        }
        if let Some(v) = params.get("cooldown_period_secs") {
            self.cooldown_period = Duration::from_secs(parse::<u64>("cooldown_period_secs", v)?);
        }

        if self.max_restarts == 0 && self.enabled {
            return Err("max_restarts must be at least 1 while auto-restart is enabled".to_string());
        }
        if self.time_window.is_zero() {
            return Err("time_window_secs must be positive".to_string());
        }
        Ok(self.clamped())
    }
}
