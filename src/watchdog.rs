//! Liveness supervision for detector workers and camera processing loops.
//!
//! Each worker exposes the start time of the unit of work in progress. The
//! watchdog restarts a worker whose work has been in progress for too long
//! or whose thread died; a worker that cannot be replaced on its own
//! escalates to a restart of the whole pipeline.

use crate::detect::DetectorProcess;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{now_timestamp, FrameTime};
use crate::recovery::{RecoveryAction, RecoveryConfig, RecoveryManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A worker the process watchdog can observe and replace
pub trait SupervisedWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Start of the unit of work in progress, 0 when idle
    fn busy_since(&self) -> FrameTime;

    fn is_alive(&self) -> bool;

    /// Replace the worker. Returns false when it can only come back with
    /// the rest of the pipeline.
    fn restart(&self) -> bool;
}

impl SupervisedWorker for DetectorProcess {
    fn name(&self) -> &str {
        DetectorProcess::name(self)
    }

    fn busy_since(&self) -> FrameTime {
        self.detection_start()
    }

    fn is_alive(&self) -> bool {
        DetectorProcess::is_alive(self)
    }

    fn restart(&self) -> bool {
        match self.start_or_restart() {
            Ok(()) => true,
            Err(e) => {
                error!("Cannot restart detector {}: {}", DetectorProcess::name(self), e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerHealth {
    Healthy,
    Stuck { busy_secs: f64 },
    Exited,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Stuck { busy_secs } => write!(f, "stuck for {:.1}s", busy_secs),
            WorkerHealth::Exited => write!(f, "exited"),
        }
    }
}

pub fn assess(busy_since: FrameTime, alive: bool, now: FrameTime, stuck_after: f64) -> WorkerHealth {
    if !alive {
        return WorkerHealth::Exited;
    }
    if busy_since > 0.0 {
        let busy_secs = now - busy_since;
        if busy_secs > stuck_after {
            return WorkerHealth::Stuck { busy_secs };
        }
    }
    WorkerHealth::Healthy
}

/// A failure the watchdog could not fix locally
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub worker: String,
    pub reason: String,
}

impl std::fmt::Display for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.worker, self.reason)
    }
}

pub struct ProcessWatchdog {
    workers: Vec<Arc<dyn SupervisedWorker>>,
    stuck_after: f64,
    recovery: RecoveryManager,
    /// Workers waiting out a restart backoff
    pending: HashMap<String, Instant>,
    events: EventBus,
}

impl ProcessWatchdog {
    pub fn new(stuck_after: f64, recovery: RecoveryConfig, events: EventBus) -> Self {
        Self {
            workers: Vec::new(),
            stuck_after,
            recovery: RecoveryManager::with_config(recovery),
            pending: HashMap::new(),
            events,
        }
    }

    pub fn add(&mut self, worker: Arc<dyn SupervisedWorker>) {
        debug!("Watching worker {}", worker.name());
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// One pass over every worker. Returns the names of restarted workers.
    pub fn check(&mut self) -> Result<Vec<String>, Escalation> {
        self.check_at(now_timestamp(), Instant::now())
    }

    pub fn check_at(&mut self, now: FrameTime, instant: Instant) -> Result<Vec<String>, Escalation> {
        let mut restarted = Vec::new();
        for worker in self.workers.clone() {
            let name = worker.name().to_string();
            if let Some(due) = self.pending.get(&name) {
                if instant < *due {
                    continue;
                }
                self.pending.remove(&name);
                self.restart(worker.as_ref(), "backoff elapsed")?;
                restarted.push(name);
                continue;
            }

            let health = assess(worker.busy_since(), worker.is_alive(), now, self.stuck_after);
            if health == WorkerHealth::Healthy {
                if self.recovery.restart_count(&name) > 0 {
                    self.recovery.reset(&name);
                }
                continue;
            }

            warn!("Worker {} is {}", name, health);
            match self.recovery.record_failure_at(&name, instant) {
                RecoveryAction::Restart => {
                    self.restart(worker.as_ref(), &health.to_string())?;
                    restarted.push(name);
                }
                RecoveryAction::RestartAfterDelay(delay) => {
                    self.pending.insert(name, instant + delay);
                }
            }
        }
        Ok(restarted)
    }

    fn restart(&self, worker: &dyn SupervisedWorker, reason: &str) -> Result<(), Escalation> {
        if !worker.restart() {
            error!("Worker {} cannot be restarted on its own", worker.name());
            return Err(Escalation {
                worker: worker.name().to_string(),
                reason: reason.to_string(),
            });
        }
        self.events.publish(PipelineEvent::WorkerRestarted {
            worker: worker.name().to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Check every `interval` after `startup_delay` until cancelled. Returns
    /// the escalation that requires a pipeline restart, if any.
    pub async fn run(
        mut self,
        interval: Duration,
        startup_delay: Duration,
        cancel: CancellationToken,
    ) -> Option<Escalation> {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(startup_delay) => {}
        }
        info!("Process watchdog supervising {} workers", self.workers.len());

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Process watchdog stopping");
                    return None;
                }
                _ = ticker.tick() => {
                    if let Err(escalation) = self.check() {
                        return Some(escalation);
                    }
                }
            }
        }
    }
}
