use crate::config::WatchdogConfig;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What a watchdog should do about a failed component
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Restart right away
    Restart,
    /// Restart once the delay has elapsed
    RestartAfterDelay(Duration),
}

/// Restart budget configuration
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Restarts tolerated inside `window` before backing off
    pub max_restarts: u32,
    pub window: Duration,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between restarts
    pub max_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl From<&WatchdogConfig> for RecoveryConfig {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: Duration::from_secs(config.restart_window_secs),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

/// Tracks restarts per component. Components that keep failing are flagged as
/// a persistent restart loop and restarted with growing delays instead of
/// immediately, so a dead stream does not spin the host.
pub struct RecoveryManager {
    config: RecoveryConfig,
    restarts: HashMap<String, VecDeque<Instant>>,
    degraded: HashMap<String, bool>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self::with_config(RecoveryConfig::default())
    }

    pub fn with_config(config: RecoveryConfig) -> Self {
        Self {
            config,
            restarts: HashMap::new(),
            degraded: HashMap::new(),
        }
    }

    /// Record a failure of `component` and decide how to restart it
    pub fn record_failure(&mut self, component: &str) -> RecoveryAction {
        self.record_failure_at(component, Instant::now())
    }

    pub fn record_failure_at(&mut self, component: &str, now: Instant) -> RecoveryAction {
        let window = self.config.window;
        let history = self.restarts.entry(component.to_string()).or_default();
        while let Some(first) = history.front() {
            if now.duration_since(*first) > window {
                history.pop_front();
            } else {
                break;
            }
        }
        history.push_back(now);
        let recent = history.len() as u32;

        if recent <= self.config.max_restarts {
            info!(
                "Restarting {} (attempt {}/{} in window)",
                component, recent, self.config.max_restarts
            );
            return RecoveryAction::Restart;
        }

        let over = recent - self.config.max_restarts - 1;
        let delay = self.calculate_delay(over);
        if !self.degraded.insert(component.to_string(), true).unwrap_or(false) {
            error!(
                "{} restarted {} times within {:?}, possible resource exhaustion; backing off",
                component, recent, window
            );
        } else {
            warn!("{} still failing, next restart in {:?}", component, delay);
        }
        RecoveryAction::RestartAfterDelay(delay)
    }

    /// Forget the failure history once a component is healthy again
    pub fn reset(&mut self, component: &str) {
        if self.restarts.remove(component).is_some() {
            info!("Component {} recovered, reset restart history", component);
        }
        self.degraded.remove(component);
    }

    pub fn is_degraded(&self, component: &str) -> bool {
        self.degraded.get(component).copied().unwrap_or(false)
    }

    pub fn restart_count(&self, component: &str) -> usize {
        self.restarts.get(component).map(VecDeque::len).unwrap_or(0)
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}
