//! Orchestrator statistics, health reports, and metrics sinks.
//!
//! Counters are plain atomics bumped on the hot path. Snapshots are assembled
//! on demand by the orchestrator and pushed periodically to a [`MetricsSink`].

use crate::core::task::TaskStatus;
use crate::orchestration::breaker::{BreakerSnapshot, CircuitState};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

// =============================================================================
// Counters
// =============================================================================

/// Lifetime task counters.
#[derive(Debug, Default)]
pub struct TaskCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    workers_replaced: AtomicU64,
}

impl TaskCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self, n: u64) {
        self.submitted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_replaced(&self) {
        self.workers_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Completed => &self.completed,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Cancelled => &self.cancelled,
            TaskStatus::TimedOut => &self.timed_out,
            TaskStatus::Queued | TaskStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> TaskTotals {
        TaskTotals {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            workers_replaced: self.workers_replaced.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTotals {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub workers_replaced: u64,
}

impl TaskTotals {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled + self.timed_out
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneStats {
    pub queue_depth: usize,
    pub workers: usize,
    pub busy_slots: usize,
    pub total_slots: usize,
}

/// Point-in-time view of the whole orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub running: bool,
    pub uptime_secs: f64,
    pub queue_depth: usize,
    pub io: LaneStats,
    pub cpu: LaneStats,
    pub workers: usize,
    pub unresponsive_workers: usize,
    pub utilization: f64,
    pub tasks_queued: usize,
    pub tasks_running: usize,
    pub totals: TaskTotals,
    pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

impl ComponentHealth {
    pub fn new(name: &str, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Overall status is the worst component status.
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checked_at: Utc::now(),
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Health of the breaker set: degraded while any circuit is not closed.
pub fn breaker_health(breakers: &[BreakerSnapshot]) -> ComponentHealth {
    let tripped: Vec<String> = breakers
        .iter()
        .filter(|b| b.state != CircuitState::Closed)
        .map(|b| format!("{}={}", b.name, b.state))
        .collect();
    if tripped.is_empty() {
        ComponentHealth::new(
            "breakers",
            HealthStatus::Healthy,
            format!("{} closed", breakers.len()),
        )
    } else {
        ComponentHealth::new("breakers", HealthStatus::Degraded, tripped.join(", "))
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Write-only destination for periodic snapshots.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, snapshot: &StatsSnapshot);
}

/// Logs a one-line summary of each snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn publish(&self, snapshot: &StatsSnapshot) {
        info!(
            workers = snapshot.workers,
            utilization = snapshot.utilization,
            queue_depth = snapshot.queue_depth,
            running = snapshot.tasks_running,
            completed = snapshot.totals.completed,
            failed = snapshot.totals.failed,
            "orchestrator stats"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn publish(&self, _snapshot: &StatsSnapshot) {}
}

/// Latest-wins channel sink: a slow reader only ever sees the newest snapshot.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<StatsSnapshot>,
    rx: Receiver<StatsSnapshot>,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the consumer.
    pub fn channel() -> (Self, Receiver<StatsSnapshot>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Self {
                tx,
                rx: rx.clone(),
            },
            rx,
        )
    }
}

impl MetricsSink for ChannelSink {
    fn publish(&self, snapshot: &StatsSnapshot) {
        // Discard the stale snapshot so the send below cannot block.
        let _ = self.rx.try_recv();
        let _ = self.tx.try_send(snapshot.clone());
    }
}
