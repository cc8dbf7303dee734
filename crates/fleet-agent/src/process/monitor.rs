use std::time::Duration;

use fleet_process::SupervisionState;
use tokio::{sync::watch, task::JoinHandle};

use super::ProcessSupervisor;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Poll period of the liveness loop; can change while the loop runs.
#[derive(Debug)]
pub struct ProcessMonitor {
    interval: watch::Sender<Duration>,
}

impl ProcessMonitor {
    pub fn new(interval: Duration) -> Self {
        let (interval, _) = watch::channel(interval.max(MIN_INTERVAL));
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// Takes effect at the next tick.
    pub fn set_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        self.interval.send_if_modified(|cur| {
            let changed = *cur != interval;
            *cur = interval;
            changed
        });
        tracing::debug!(interval_ms = interval.as_millis() as u64, "monitor interval set");
    }

    fn subscribe(&self) -> watch::Receiver<Duration> {
        self.interval.subscribe()
    }
}

impl ProcessSupervisor {
    /// Runs the liveness loop until the supervisor shuts down.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = this.monitor().subscribe();
            let cancel = this.cancel_token().clone();
            tracing::info!(interval_ms = this.monitor().interval().as_millis() as u64, "process monitor started");
            loop {
                let period = *interval.borrow_and_update();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = interval.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
                this.poll_once().await;
            }
            tracing::info!("process monitor stopped");
        })
    }

    /// One pass over the table: running entries whose PID died become
    /// crashes; PID-0 entries get a discovery attempt. Probing happens
    /// without the table lock held.
    pub async fn poll_once(&self) {
        let entries = self.snapshot();
        let mut changed = false;

        for entry in entries {
            match entry.state {
                SupervisionState::Running if entry.pid > 0 => {
                    if self.controller().is_alive(entry.pid) {
                        continue;
                    }
                    let pid = entry.pid;
                    // Only a still-running entry with the same PID counts; a
                    // stop or restart may have raced the probe.
                    let confirmed = self
                        .update(&entry.name, |t| {
                            if t.state != SupervisionState::Running || t.pid != pid {
                                return false;
                            }
                            t.state = SupervisionState::Crashed;
                            t.last_pid = pid;
                            t.pid = 0;
                            true
                        })
                        .unwrap_or(false);
                    if confirmed {
                        tracing::warn!(name = %entry.name, pid, "process exited unexpectedly");
                        self.handle_crash(&entry, pid);
                        changed = true;
                    }
                }
                SupervisionState::Crashed
                | SupervisionState::StoppedIntentionally
                | SupervisionState::Unknown
                    if entry.pid == 0 =>
                {
                    let Some(found) = self.controller().discover(&entry.params) else {
                        continue;
                    };
                    let adopted = self
                        .update(&entry.name, |t| {
                            if t.pid != 0 || t.state == SupervisionState::Restarting {
                                return None;
                            }
                            t.adopt_discovered(found);
                            Some(t.clone())
                        })
                        .flatten();
                    if let Some(adopted) = adopted {
                        tracing::info!(name = %entry.name, pid = found, "discovered running process");
                        self.announce_start(&adopted, true);
                        changed = true;
                    }
                }
                _ => {}
            }
        }

        if changed {
            self.persist().await;
        }
    }
}
