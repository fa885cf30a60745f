//! Autoscaling control loop.
//!
//! At a fixed interval the autoscaler samples queue depth and slot
//! utilization, asks [`ScalePolicy::decide`] what to do, and applies the
//! decision to the pool. Utilization is busy slots over total slots; when
//! there is backlog and every slot is busy it reads as 1.0. The same measure
//! is taken per lane, so a saturated CPU lane can trigger scale-up while the
//! I/O lane sits idle.

use crate::config::Config;
use crate::core::task::Lane;
use crate::orchestration::pool::{PoolLoad, WorkerPool};
use crate::queue::PriorityTaskQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One observation of load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    pub io_depth: usize,
    pub cpu_depth: usize,
    pub load: PoolLoad,
}

impl LoadSample {
    pub fn depth(&self) -> usize {
        self.io_depth + self.cpu_depth
    }

    pub fn lane_depth(&self, lane: Lane) -> usize {
        match lane {
            Lane::Io => self.io_depth,
            Lane::Cpu => self.cpu_depth,
        }
    }

    pub fn utilization(&self) -> f64 {
        let slots = self.load.slots();
        if slots == 0 {
            return if self.depth() > 0 { 1.0 } else { 0.0 };
        }
        let busy = self.load.busy();
        if busy >= slots && self.depth() > 0 {
            return 1.0;
        }
        busy as f64 / slots as f64
    }

    pub fn lane_utilization(&self, lane: Lane) -> f64 {
        let load = self.load.lane(lane);
        let backlog = self.lane_depth(lane) > 0;
        if load.slots == 0 {
            return if backlog { 1.0 } else { 0.0 };
        }
        if load.busy >= load.slots && backlog {
            return 1.0;
        }
        load.busy as f64 / load.slots as f64
    }

    /// Lane whose backlog per worker is largest.
    pub fn hottest_lane(&self) -> Lane {
        let pressure = |lane: Lane| {
            let workers = self.load.lane(lane).workers.max(1);
            self.lane_depth(lane) as f64 / workers as f64
        };
        if pressure(Lane::Cpu) > pressure(Lane::Io) {
            Lane::Cpu
        } else {
            Lane::Io
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp { lane: Lane, count: usize },
    ScaleDown { count: usize },
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub step: usize,
}

impl From<&Config> for ScalePolicy {
    fn from(config: &Config) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            step: config.scale_step,
        }
    }
}

impl ScalePolicy {
    pub fn decide(&self, sample: &LoadSample) -> ScaleDecision {
        let workers = sample.load.workers();
        let utilization = sample.utilization();
        let hottest = sample.hottest_lane();
        let pressured = utilization > self.scale_up_threshold
            || sample.lane_utilization(hottest) > self.scale_up_threshold;

        if pressured && sample.depth() > 0 && workers < self.max_workers {
            let count = self.step.min(self.max_workers - workers);
            return ScaleDecision::ScaleUp {
                lane: hottest,
                count,
            };
        }
        // A saturated lane blocks scale-down even when the pool as a whole is quiet.
        if utilization < self.scale_down_threshold && !pressured && workers > self.min_workers {
            let count = self.step.min(workers - self.min_workers);
            return ScaleDecision::ScaleDown { count };
        }
        ScaleDecision::Hold
    }
}

pub struct Autoscaler {
    policy: ScalePolicy,
    pool: Arc<WorkerPool>,
    queue: Arc<PriorityTaskQueue>,
    interval: Duration,
}

impl Autoscaler {
    pub fn new(
        policy: ScalePolicy,
        pool: Arc<WorkerPool>,
        queue: Arc<PriorityTaskQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            policy,
            pool,
            queue,
            interval,
        }
    }

    pub fn sample(&self) -> LoadSample {
        LoadSample {
            io_depth: self.queue.lane_depth(Lane::Io),
            cpu_depth: self.queue.lane_depth(Lane::Cpu),
            load: self.pool.load(),
        }
    }

    /// Take one sample and apply the resulting decision.
    pub fn tick(&self) -> ScaleDecision {
        let sample = self.sample();
        let decision = self.policy.decide(&sample);
        match decision {
            ScaleDecision::ScaleUp { lane, count } => {
                let added = self.pool.scale_up(lane, count);
                info!(
                    lane = %lane,
                    added = added.len(),
                    workers = self.pool.live_count(),
                    utilization = sample.utilization(),
                    depth = sample.depth(),
                    "Scaled up"
                );
            }
            ScaleDecision::ScaleDown { count } => {
                let retired = self.pool.retire_idle(count);
                if !retired.is_empty() {
                    info!(
                        retired = retired.len(),
                        workers = self.pool.live_count(),
                        utilization = sample.utilization(),
                        "Scaled down"
                    );
                }
            }
            ScaleDecision::Hold => {}
        }
        decision
    }

    /// Runs the control loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(interval_ms = self.interval.as_millis() as u64, "Autoscaler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        debug!("Autoscaler stopped");
    }
}

impl std::fmt::Debug for Autoscaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autoscaler")
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .finish()
    }
}
