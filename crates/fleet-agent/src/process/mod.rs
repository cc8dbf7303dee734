//! Supervision of the engine's OS processes: controller (start/stop),
//! monitor (liveness polling), auto-restart policy, and the supervisor that
//! owns the tracked-process table.

pub mod controller;
pub mod monitor;
pub mod restart;
pub mod supervisor;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use fleet_process::{DeploymentMode, SupervisionState, is_hybrid_role, process_name};

use crate::error::ProcessError;

pub use controller::{OsProcessController, ProcessController, StopOutcome};
pub use monitor::ProcessMonitor;
pub use restart::{AutoRestartPolicy, RestartDecision};
pub use supervisor::{EventCallback, ProcessSupervisor, StartReport, StopReport};

/// Everything needed to (re)launch one engine process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StartParams {
    pub base_name: String,
    pub install_dir: String,
    pub deployment_mode: DeploymentMode,
    pub role: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StartParams {
    pub fn new(install_dir: impl Into<String>, mode: DeploymentMode, role: impl Into<String>) -> Self {
        Self {
            base_name: fleet_process::DEFAULT_BASE_NAME.to_string(),
            install_dir: install_dir.into(),
            deployment_mode: mode,
            role: role.into(),
            env: BTreeMap::new(),
        }
    }

    /// Tracking key; see [`fleet_process::process_name`].
    pub fn name(&self) -> String {
        process_name(&self.base_name, self.deployment_mode, &self.role)
    }

    /// Role passed to the launcher, `None` for a hybrid process.
    pub fn launcher_role(&self) -> Option<&str> {
        match self.deployment_mode {
            DeploymentMode::Separated if !is_hybrid_role(&self.role) => Some(self.role.trim()),
            _ => None,
        }
    }

    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ProcessError> {
        let get = |k: &str| params.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        let install_dir = get("install_dir")
            .ok_or_else(|| ProcessError::InvalidParams("install_dir is required".to_string()))?;
        let deployment_mode = match get("deployment_mode") {
            Some(raw) => DeploymentMode::parse(raw).ok_or_else(|| {
                ProcessError::InvalidParams(format!("unknown deployment_mode: {raw}"))
            })?,
            None => DeploymentMode::Hybrid,
        };
        let role = get("role").unwrap_or_default().to_string();
        if deployment_mode == DeploymentMode::Separated
            && !is_hybrid_role(&role)
            && !matches!(role.to_ascii_lowercase().as_str(), "master" | "worker")
        {
            return Err(ProcessError::InvalidParams(format!("unknown role: {role}")));
        }

        let mut env = BTreeMap::new();
        if let Some(v) = get("java_home") {
            env.insert("JAVA_HOME".to_string(), v.to_string());
        }
        if let Some(v) = get("jvm_options") {
            env.insert("JAVA_OPTS".to_string(), v.to_string());
        }

        Ok(Self {
            base_name: get("process_name")
                .unwrap_or(fleet_process::DEFAULT_BASE_NAME)
                .to_string(),
            install_dir: install_dir.to_string(),
            deployment_mode,
            role,
            env,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackingOrigin {
    /// We saw it start (or started it ourselves): announce it.
    Observed,
    /// It was already running when tracking began: stay quiet.
    Silent,
}

/// One supervised process. `pid == 0` means "not running, still supervised".
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedProcess {
    pub name: String,
    pub pid: u32,
    /// PID before the most recent crash or stop.
    pub last_pid: u32,
    pub params: StartParams,
    pub state: SupervisionState,
    pub tracked_since: DateTime<Utc>,
    origin: TrackingOrigin,
}

impl TrackedProcess {
    fn with_origin(params: StartParams, pid: u32, origin: TrackingOrigin) -> Self {
        Self {
            name: params.name(),
            pid,
            last_pid: 0,
            state: if pid > 0 {
                SupervisionState::Running
            } else {
                SupervisionState::Unknown
            },
            params,
            tracked_since: Utc::now(),
            origin,
        }
    }

    /// A process we launched or watched come up.
    pub fn observed(params: StartParams, pid: u32) -> Self {
        Self::with_origin(params, pid, TrackingOrigin::Observed)
    }

    /// A process that was already running before tracking began.
    pub fn declared_silent(params: StartParams, pid: u32) -> Self {
        Self::with_origin(params, pid, TrackingOrigin::Silent)
    }

    pub fn announces_start(&self) -> bool {
        self.origin == TrackingOrigin::Observed && self.pid > 0
    }

    /// Records a process found running under this entry. Its start was
    /// observed, so it is announced whatever the entry's origin.
    pub(crate) fn adopt_discovered(&mut self, pid: u32) {
        self.pid = pid;
        self.state = SupervisionState::Running;
        self.origin = TrackingOrigin::Observed;
    }

    pub fn install_dir(&self) -> &str {
        &self.params.install_dir
    }

    pub fn role(&self) -> &str {
        &self.params.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn separated_worker_is_tracked_with_suffix() {
        let p = StartParams::from_params(&params(&[
            ("install_dir", "/opt/seatunnel"),
            ("deployment_mode", "separated"),
            ("role", "worker"),
        ]))
        .unwrap();
        assert_eq!(p.name(), "seatunnel-worker");
        assert_eq!(p.launcher_role(), Some("worker"));
    }

    #[test]
    fn hybrid_role_is_tracked_under_base_name() {
        let p = StartParams::from_params(&params(&[
            ("install_dir", "/opt/seatunnel"),
            ("deployment_mode", "separated"),
            ("role", "hybrid"),
        ]))
        .unwrap();
        assert_eq!(p.name(), "seatunnel");
        assert_eq!(p.launcher_role(), None);
    }

    #[test]
    fn from_params_validates() {
        assert!(matches!(
            StartParams::from_params(&params(&[("role", "worker")])),
            Err(ProcessError::InvalidParams(_))
        ));
        assert!(StartParams::from_params(&params(&[
            ("install_dir", "/opt/st"),
            ("deployment_mode", "sideways"),
        ]))
        .is_err());
        assert!(StartParams::from_params(&params(&[
            ("install_dir", "/opt/st"),
            ("deployment_mode", "separated"),
            ("role", "janitor"),
        ]))
        .is_err());
    }

    #[test]
    fn silent_tracking_never_announces() {
        let p = StartParams::new("/opt/st", DeploymentMode::Hybrid, "");
        assert!(TrackedProcess::observed(p.clone(), 42).announces_start());
        assert!(!TrackedProcess::observed(p.clone(), 0).announces_start());
        assert!(!TrackedProcess::declared_silent(p.clone(), 42).announces_start());

        let mut waiting = TrackedProcess::declared_silent(p, 0);
        waiting.adopt_discovered(77);
        assert!(waiting.announces_start());
        assert_eq!(waiting.state, SupervisionState::Running);
    }
}
