//! Worker health probing.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{LaunchedWorker, WorkerBackend};

use super::WorkerSupervisor;

/// Consecutive probe failures for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTracker {
    pub consecutive_failures: u32,
    /// Retries allowed after the first failure.
    pub max_retries: u32,
}

impl HealthTracker {
    pub const fn new(max_retries: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_retries,
        }
    }

    pub const fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub const fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// True once the first failure and every retry after it have failed.
    pub const fn exhausted(&self) -> bool {
        self.consecutive_failures > self.max_retries
    }
}

/// Outcome of a full probe round for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Exhausted { attempts: u32, reason: String },
}

/// Probe once, then retry up to `max_retries` times, each bounded by `timeout`.
pub async fn probe_with_retries(
    backend: &dyn WorkerBackend,
    worker: &LaunchedWorker,
    timeout: Duration,
    max_retries: u32,
) -> ProbeOutcome {
    let mut tracker = HealthTracker::new(max_retries);
    let mut reason = String::new();
    while !tracker.exhausted() {
        match tokio::time::timeout(timeout, backend.probe(worker)).await {
            Ok(Ok(())) => {
                if tracker.consecutive_failures > 0 {
                    debug!(
                        worker_id = %worker.profile_id,
                        retries = tracker.consecutive_failures,
                        "Probe recovered"
                    );
                }
                tracker.record_success();
                return ProbeOutcome::Healthy;
            }
            Ok(Err(e)) => reason = e.to_string(),
            Err(_) => reason = format!("probe timed out after {}ms", timeout.as_millis()),
        }
        tracker.record_failure();
        warn!(
            worker_id = %worker.profile_id,
            port = worker.port,
            failures = tracker.consecutive_failures,
            reason = %reason,
            "Health probe failed"
        );
    }
    ProbeOutcome::Exhausted {
        attempts: tracker.consecutive_failures,
        reason,
    }
}

/// Run [`WorkerSupervisor::check_health`] every `interval` until shutdown.
pub fn spawn_health_task(
    supervisor: WorkerSupervisor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    supervisor.check_health().await;
                }
                _ = shutdown.changed() => {
                    info!("Health monitor shutting down");
                    return;
                }
            }
        }
    })
}
