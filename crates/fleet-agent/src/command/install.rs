use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use fleet_process::DeploymentMode;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

use super::ProgressSink;

const TAIL_LINES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub version: String,
    pub install_dir: String,
    pub deployment_mode: DeploymentMode,
    pub role: String,
    /// Every command parameter, passed through to the installer.
    pub params: BTreeMap<String, String>,
}

impl InstallRequest {
    pub fn from_params(params: &HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |k: &str| {
            params
                .get(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let version = get("version").context("version is required")?;
        let install_dir = get("install_dir").context("install_dir is required")?;
        let deployment_mode = match get("deployment_mode") {
            Some(raw) => DeploymentMode::parse(&raw)
                .with_context(|| format!("unknown deployment_mode: {raw}"))?,
            None => DeploymentMode::Hybrid,
        };
        Ok(Self {
            version,
            install_dir,
            deployment_mode,
            role: get("role").unwrap_or_default(),
            params: params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// `FLEET_INSTALL_*` environment handed to the installer.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .params
            .iter()
            .map(|(k, v)| (format!("FLEET_INSTALL_{}", env_key(k)), v.clone()))
            .collect();
        env.insert("FLEET_INSTALL_VERSION".to_string(), self.version.clone());
        env.insert("FLEET_INSTALL_DIR".to_string(), self.install_dir.clone());
        env.insert(
            "FLEET_INSTALL_DEPLOYMENT_MODE".to_string(),
            self.deployment_mode.as_str().to_string(),
        );
        env.insert("FLEET_INSTALL_ROLE".to_string(), self.role.clone());
        env
    }
}

fn env_key(param: &str) -> String {
    param
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `PROGRESS <percent> <message>` on installer stdout.
fn parse_progress_line(line: &str) -> Option<(u32, String)> {
    let rest = line.trim().strip_prefix("PROGRESS ")?;
    let (pct, msg) = match rest.split_once(' ') {
        Some((pct, msg)) => (pct, msg.trim()),
        None => (rest, ""),
    };
    let pct: u32 = pct.trim_end_matches('%').parse().ok()?;
    Some((pct.min(100), msg.to_string()))
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

/// Installs (or upgrades) the engine on this node.
#[tonic::async_trait]
pub trait Installer: Send + Sync + 'static {
    async fn install(&self, req: &InstallRequest, progress: &ProgressSink) -> anyhow::Result<String>;
}

/// Delegates installation to an operator-provided executable. Parameters
/// arrive as `FLEET_INSTALL_*` variables; stdout lines of the form
/// `PROGRESS <pct> <msg>` become progress updates.
#[derive(Debug, Clone)]
pub struct ProgramInstaller {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProgramInstaller {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(cfg: &crate::config::InstallerConfig) -> Option<Self> {
        let program = cfg.program.clone()?;
        Some(Self::new(
            program,
            cfg.args.clone(),
            Duration::from_secs(cfg.timeout_secs),
        ))
    }
}

#[tonic::async_trait]
impl Installer for ProgramInstaller {
    async fn install(&self, req: &InstallRequest, progress: &ProgressSink) -> anyhow::Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(req.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn installer {}", self.program.display()))?;
        tracing::info!(program = %self.program.display(), version = %req.version, "installer started");
        progress.report(0, format!("installing {}", req.version));

        let stdout = child.stdout.take().context("installer stdout")?;
        let stderr = child.stderr.take().context("installer stderr")?;
        let stderr_tail = tokio::spawn(async move {
            let mut tail = VecDeque::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                push_tail(&mut tail, line);
            }
            tail
        });

        let mut out_tail = VecDeque::new();
        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_progress_line(&line) {
                    Some((pct, msg)) => progress.report(pct, msg),
                    None => push_tail(&mut out_tail, line),
                }
            }
            child.wait().await
        };

        let outcome = tokio::time::timeout(self.timeout, run).await;
        let status = match outcome {
            Ok(status) => status.context("wait for installer")?,
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("installer timed out after {}s", self.timeout.as_secs());
            }
        };

        let err_tail = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            let detail = err_tail.into_iter().collect::<Vec<_>>().join("\n");
            anyhow::bail!("installer exited with {status}: {detail}");
        }
        Ok(out_tail.into_iter().collect::<Vec<_>>().join("\n"))
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
    fn progress_lines_are_recognized() {
        assert_eq!(
            parse_progress_line("PROGRESS 40 downloading package"),
            Some((40, "downloading package".to_string()))
        );
        assert_eq!(parse_progress_line("PROGRESS 70%"), Some((70, String::new())));
        assert_eq!(parse_progress_line("PROGRESS 400 x"), Some((100, "x".to_string())));
        assert_eq!(parse_progress_line("progress 40"), None);
        assert_eq!(parse_progress_line("PROGRESS soon"), None);
    }

    #[test]
    fn request_requires_version_and_dir() {
        assert!(InstallRequest::from_params(&params(&[("version", "2.3.8")])).is_err());
        let req = InstallRequest::from_params(&params(&[
            ("version", "2.3.8"),
            ("install_dir", "/opt/seatunnel"),
            ("jvm.heap-size", "4g"),
        ]))
        .unwrap();
        let env = req.env();
        assert_eq!(env["FLEET_INSTALL_VERSION"], "2.3.8");
        assert_eq!(env["FLEET_INSTALL_JVM_HEAP_SIZE"], "4g");
        assert_eq!(env["FLEET_INSTALL_DEPLOYMENT_MODE"], "hybrid");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_output_drives_progress() {
        let installer = ProgramInstaller::new(
            "/bin/sh",
            vec![
                "-c".to_string(),
                "echo PROGRESS 50 fetching; echo \"installed $FLEET_INSTALL_VERSION\"".to_string(),
            ],
            Duration::from_secs(10),
        );
        let req = InstallRequest::from_params(&params(&[
            ("version", "2.3.8"),
            ("install_dir", "/tmp/st"),
        ]))
        .unwrap();

        let (sink, mut rx) = ProgressSink::channel("c1");
        let out = installer.install(&req, &sink).await.unwrap();
        assert_eq!(out, "installed 2.3.8");

        assert_eq!(rx.recv().await.unwrap().progress, 0);
        let p = rx.recv().await.unwrap();
        assert_eq!((p.progress, p.message.as_str()), (50, "fetching"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_reports_stderr() {
        let installer = ProgramInstaller::new(
            "/bin/sh",
            vec!["-c".to_string(), "echo 'no space left' >&2; exit 3".to_string()],
            Duration::from_secs(10),
        );
        let req = InstallRequest::from_params(&params(&[
            ("version", "2.3.8"),
            ("install_dir", "/tmp/st"),
        ]))
        .unwrap();
        let err = installer
            .install(&req, &ProgressSink::discard("c1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no space left"));
    }
}
