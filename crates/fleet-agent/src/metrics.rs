//! Host and per-process inspection backed by `/proc` and `libc`.
//!
//! Everything here is a point-in-time query. The only state kept is the
//! previous CPU sample so percentages can be computed as deltas.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::Instant,
};

use fleet_proto::coordinator_v1::{ResourceUsage, SystemInfo};

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

/// Process state letter from the contents of `/proc/<pid>/stat`.
fn parse_stat_state(stat: &str) -> Option<char> {
    let end = stat.rfind(')')?;
    stat.get((end + 2)..)?.chars().next()
}

/// utime + stime from the contents of `/proc/<pid>/stat`.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// Signal-0 liveness probe. A zombie counts as dead: it no longer runs but
/// `kill(pid, 0)` still succeeds until it is reaped.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // EPERM: the process exists but belongs to someone else.
        if err.raw_os_error() != Some(libc::EPERM) {
            return false;
        }
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !matches!(parse_stat_state(&stat), Some('Z') | Some('X')),
        Err(_) => !cfg!(target_os = "linux"),
    }
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    parse_stat_cpu_ticks(&s)
}

async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await.ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

/// (total, idle) jiffies from the aggregate `cpu` line of `/proc/stat`.
fn parse_host_cpu(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total, idle))
}

/// (MemTotal, MemAvailable) in bytes.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut it = line.split_whitespace();
        let key = it.next()?;
        let kb: u64 = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        match key {
            "MemTotal:" => total = Some(kb * 1024),
            "MemAvailable:" => available = Some(kb * 1024),
            _ => {}
        }
    }
    Some((total?, available.unwrap_or(0)))
}

#[cfg(unix)]
fn disk_totals(p: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    let frsize = s.f_frsize as u64;
    let total = (s.f_blocks as u64).saturating_mul(frsize);
    let avail = (s.f_bavail as u64).saturating_mul(frsize);
    Some((total, avail))
}

#[cfg(not(unix))]
fn disk_totals(_p: &Path) -> Option<(u64, u64)> {
    None
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Static facts reported on registration.
pub fn system_info(disk_path: &Path) -> SystemInfo {
    let total_memory_bytes = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo(&s))
        .map(|(t, _)| t)
        .unwrap_or(0);
    SystemInfo {
        hostname: read_trimmed("/proc/sys/kernel/hostname")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        total_memory_bytes,
        total_disk_bytes: disk_totals(disk_path).map(|(t, _)| t).unwrap_or(0),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// Keeps the previous CPU samples needed for delta-based percentages.
#[derive(Debug)]
pub struct MetricsCollector {
    disk_path: PathBuf,
    host_cpu: Mutex<Option<(u64, u64)>>,
    pid_cpu: Mutex<HashMap<u32, (u64, Instant)>>,
}

impl MetricsCollector {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            host_cpu: Mutex::new(None),
            pid_cpu: Mutex::new(HashMap::new()),
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        system_info(&self.disk_path)
    }

    /// Host usage. CPU is 0 on the very first call (no previous sample).
    pub async fn host_usage(&self) -> ResourceUsage {
        let cpu_percent = match tokio::fs::read_to_string("/proc/stat").await {
            Ok(stat) => match parse_host_cpu(&stat) {
                Some((total, idle)) => {
                    let mut last = self.host_cpu.lock().unwrap_or_else(|e| e.into_inner());
                    let pct = match *last {
                        Some((pt, pi)) if total > pt => {
                            let dt = total - pt;
                            let di = idle.saturating_sub(pi);
                            percent(dt.saturating_sub(di), dt)
                        }
                        _ => 0.0,
                    };
                    *last = Some((total, idle));
                    pct
                }
                None => 0.0,
            },
            Err(_) => 0.0,
        };

        let memory_percent = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_meminfo(&s))
            .map(|(total, avail)| percent(total.saturating_sub(avail), total))
            .unwrap_or(0.0);

        let disk_percent = disk_totals(&self.disk_path)
            .map(|(total, avail)| percent(total.saturating_sub(avail), total))
            .unwrap_or(0.0);

        let load_average_1m = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
            .unwrap_or(0.0);

        ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
            load_average_1m,
        }
    }

    /// Per-PID CPU and RSS. `None` when the PID is gone.
    pub async fn process_stats(&self, pid: u32) -> Option<ProcessStats> {
        if pid == 0 {
            return None;
        }
        let now = Instant::now();
        let ticks = read_proc_cpu_ticks(pid).await?;
        let rss_bytes = read_proc_rss_bytes(pid).await.unwrap_or(0);

        let mut samples = self.pid_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let cpu_percent = samples
            .get(&pid)
            .map(|(prev_ticks, prev_at)| cpu_percent(*prev_ticks, *prev_at, ticks, now))
            .unwrap_or(0.0);
        samples.insert(pid, (ticks, now));

        Some(ProcessStats {
            cpu_percent,
            rss_bytes,
        })
    }

    /// Drops CPU samples for PIDs no longer of interest.
    pub fn retain_pids(&self, live: &[u32]) {
        let mut samples = self.pid_cpu.lock().unwrap_or_else(|e| e.into_inner());
        samples.retain(|pid, _| live.contains(pid));
    }
}

/// Processes whose command line contains every needle, as `(pid, cmdline)`
/// sorted by PID. Our own PID is skipped.
pub fn find_processes_by_cmdline(needles: &[&str]) -> Vec<(u32, String)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let me = std::process::id();
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == me {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = cmdline_text(&raw);
        if !cmdline.is_empty() && needles.iter().all(|n| cmdline.contains(n)) {
            out.push((pid, cmdline));
        }
    }
    out.sort_unstable_by_key(|(pid, _)| *pid);
    out
}

fn cmdline_text(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
