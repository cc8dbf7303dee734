//! Crash-to-restart admission: delay, rolling-window rate limit and cooldown.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use fleet_process::{MAX_RESTART_DURATION, RestartConfig};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Disabled,
    InCooldown { remaining: Duration },
    /// Too many attempts inside the window; a cooldown has just begun.
    RateLimited { cooldown: Duration },
    Attempt { attempt: u32, delay: Duration },
}

impl RestartDecision {
    /// Reason carried on a `restart_failed` event, if this decision skips
    /// the restart.
    pub fn refusal_reason(&self) -> Option<&'static str> {
        match self {
            Self::InCooldown { .. } => Some("in cooldown"),
            Self::RateLimited { .. } => Some("rate limit exceeded"),
            Self::Disabled | Self::Attempt { .. } => None,
        }
    }
}

/// Per-name attempt history.
#[derive(Debug, Clone, Default)]
pub struct RestartState {
    attempts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct AutoRestartPolicy {
    config: RwLock<RestartConfig>,
    states: Mutex<HashMap<String, RestartState>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AutoRestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config: RwLock::new(config.clamped()),
            states: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RestartConfig {
        *self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().unwrap_or_else(|e| e.into_inner()).enabled
    }

    /// Swaps the configuration and returns the previous one. Applies to the
    /// next crash; an attempt already waiting re-checks `enabled`.
    pub fn set_config(&self, config: RestartConfig) -> RestartConfig {
        let mut slot = self.config.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, config.clamped())
    }

    /// Decides what to do about a crash of `name` observed at `now`.
    pub fn decide(&self, name: &str, now: Instant) -> RestartDecision {
        let cfg = self.config();
        if !cfg.enabled {
            return RestartDecision::Disabled;
        }

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(name.to_string()).or_default();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return RestartDecision::InCooldown {
                    remaining: until - now,
                };
            }
            state.cooldown_until = None;
            state.attempts.clear();
        }

        while state
            .attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= cfg.time_window)
        {
            state.attempts.pop_front();
        }

        if state.attempts.len() as u32 >= cfg.max_restarts {
            let until = now
                .checked_add(cfg.cooldown_period)
                .or_else(|| now.checked_add(MAX_RESTART_DURATION))
                .unwrap_or(now);
            state.cooldown_until = Some(until);
            return RestartDecision::RateLimited {
                cooldown: cfg.cooldown_period,
            };
        }

        state.attempts.push_back(now);
        RestartDecision::Attempt {
            attempt: state.attempts.len() as u32,
            delay: cfg.restart_delay,
        }
    }

    /// Clears history, e.g. after an explicit start.
    pub fn reset(&self, name: &str) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn state(&self, name: &str) -> Option<RestartState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Serializes lifecycle operations on one process name.
    pub fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AutoRestartPolicy {
        AutoRestartPolicy::new(RestartConfig {
            enabled: true,
            restart_delay: Duration::from_secs(10),
            max_restarts: 3,
            time_window: Duration::from_secs(60),
            cooldown_period: Duration::from_secs(300),
        })
    }

    #[test]
    fn fourth_crash_in_window_starts_cooldown() {
        let p = policy();
        let t0 = Instant::now();
        let decisions: Vec<_> = (0..4)
            .map(|i| p.decide("seatunnel", t0 + Duration::from_secs(i * 2)))
            .collect();

        assert_eq!(
            decisions[0],
            RestartDecision::Attempt {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        assert!(matches!(decisions[2], RestartDecision::Attempt { attempt: 3, .. }));
        assert_eq!(
            decisions[3],
            RestartDecision::RateLimited {
                cooldown: Duration::from_secs(300)
            }
        );
        assert_eq!(decisions[3].refusal_reason(), Some("rate limit exceeded"));

        let during = p.decide("seatunnel", t0 + Duration::from_secs(100));
        assert!(matches!(during, RestartDecision::InCooldown { .. }));
        assert_eq!(during.refusal_reason(), Some("in cooldown"));

        let after = p.decide("seatunnel", t0 + Duration::from_secs(307));
        assert!(matches!(after, RestartDecision::Attempt { attempt: 1, .. }));
    }

    #[test]
    fn attempts_never_exceed_max_in_any_rolling_window() {
        let p = policy();
        let t0 = Instant::now();
        let mut admitted = Vec::new();
        // One crash every 7s for 20 minutes.
        for i in 0..170u64 {
            let now = t0 + Duration::from_secs(i * 7);
            if matches!(p.decide("w", now), RestartDecision::Attempt { .. }) {
                admitted.push(now);
            }
        }
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 3, "window starting at attempt {i} has {in_window}");
        }
        assert!(admitted.len() > 3);
    }

    #[test]
    fn window_expiry_forgets_old_attempts() {
        let p = policy();
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(matches!(
                p.decide("w", t0 + Duration::from_secs(i)),
                RestartDecision::Attempt { .. }
            ));
        }
        let later = p.decide("w", t0 + Duration::from_secs(90));
        assert!(matches!(later, RestartDecision::Attempt { attempt: 1, .. }));
    }

    #[test]
    fn names_are_independent_and_reset_clears() {
        let p = policy();
        let t0 = Instant::now();
        for _ in 0..3 {
            p.decide("a", t0);
        }
        assert!(matches!(p.decide("a", t0), RestartDecision::RateLimited { .. }));
        assert!(matches!(p.decide("b", t0), RestartDecision::Attempt { attempt: 1, .. }));

        p.reset("a");
        assert!(p.state("a").is_none());
        assert!(matches!(p.decide("a", t0), RestartDecision::Attempt { attempt: 1, .. }));
    }

    #[test]
    fn huge_cooldown_is_capped_instead_of_overflowing() {
        let p = AutoRestartPolicy::new(RestartConfig {
            cooldown_period: Duration::MAX,
            ..policy().config()
        });
        assert_eq!(p.config().cooldown_period, MAX_RESTART_DURATION);

        let t0 = Instant::now();
        for _ in 0..3 {
            p.decide("w", t0);
        }
        assert_eq!(
            p.decide("w", t0),
            RestartDecision::RateLimited {
                cooldown: MAX_RESTART_DURATION
            }
        );
        assert!(matches!(
            p.decide("w", t0 + Duration::from_secs(3600)),
            RestartDecision::InCooldown { .. }
        ));

        let mut cfg = p.config();
        cfg.restart_delay = Duration::MAX;
        p.set_config(cfg);
        assert_eq!(p.config().restart_delay, MAX_RESTART_DURATION);
    }

    #[test]
    fn disabled_policy_refuses_without_reason() {
        let p = policy();
        let mut cfg = p.config();
        cfg.enabled = false;
        let prev = p.set_config(cfg);
        assert!(prev.enabled);

        let d = p.decide("w", Instant::now());
        assert_eq!(d, RestartDecision::Disabled);
        assert_eq!(d.refusal_reason(), None);
        assert!(p.state("w").is_none());
    }
}
