//! Worker liveness monitoring.
//!
//! The `HealthMonitor` detects workers that stopped heartbeating (or whose
//! loop ended unexpectedly), marks them unresponsive, and has the pool swap
//! in a replacement at once, even at `max_workers`. Tasks the lost worker
//! held fail with `WorkerLost` and go through their retry policy like any
//! other failure.

use crate::core::payload::{FailureKind, TaskFailure};
use crate::orchestration::pool::{WorkerId, WorkerPool};
use crate::orchestration::worker::WorkerShared;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub old: WorkerId,
    pub new: WorkerId,
    pub lost_tasks: usize,
}

pub struct HealthMonitor {
    pool: Arc<WorkerPool>,
    shared: Arc<WorkerShared>,
    grace: Duration,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<WorkerPool>,
        shared: Arc<WorkerShared>,
        grace: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            shared,
            grace,
            interval,
        }
    }

    /// Check every worker once and replace the unresponsive ones.
    pub fn check(&self) -> Vec<Replacement> {
        let stale = self.pool.unresponsive(self.grace);
        let mut replacements = Vec::with_capacity(stale.len());

        for id in stale {
            self.pool.mark_unresponsive(&id);
            warn!(worker_id = %id, grace_ms = self.grace.as_millis() as u64, "Worker unresponsive");

            let Some((new, lost)) = self.pool.replace(&id) else {
                continue;
            };
            let lost_tasks = lost.len();
            for task in lost {
                let failure = TaskFailure::new(
                    FailureKind::WorkerLost,
                    format!("{id} stopped responding"),
                );
                self.shared.fail(task, failure);
            }
            replacements.push(Replacement {
                old: id,
                new,
                lost_tasks,
            });
        }
        replacements
    }

    /// Runs the monitor until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(
            interval_ms = self.interval.as_millis() as u64,
            grace_ms = self.grace.as_millis() as u64,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check();
                }
            }
        }
        debug!("Health monitor stopped");
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("grace", &self.grace)
            .field("interval", &self.interval)
            .finish()
    }
}
