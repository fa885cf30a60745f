//! Orchestration layer for taskhive.
//!
//! This module wires the queue to the worker pool and keeps it healthy:
//! routing tasks to lanes, running attempts, breaking circuits around
//! failing dependencies, scaling the pool with load, replacing lost workers,
//! and collecting results for callers.

pub mod autoscale;
pub mod breaker;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod pool;
pub mod results;
pub mod router;
pub mod stats;
pub mod worker;

pub use autoscale::{Autoscaler, LoadSample, ScaleDecision, ScalePolicy};
pub use breaker::{
    BreakerError, BreakerRegistry, BreakerSettings, BreakerSnapshot, BreakerTransition,
    CircuitBreaker, CircuitState,
};
pub use health::{HealthMonitor, Replacement};
pub use ledger::{LedgerCounts, LedgerView, TaskLedger};
pub use orchestrator::{CancelOutcome, Orchestrator};
pub use pool::{PoolEvent, PoolLoad, WorkerHealth, WorkerId, WorkerPool, WorkerSnapshot};
pub use results::ResultAggregator;
pub use router::HybridRouter;
pub use stats::{
    ChannelSink, ComponentHealth, HealthReport, HealthStatus, LaneStats, MetricsSink, NoopSink,
    StatsSnapshot, TaskCounters, TaskTotals, TracingSink,
};
pub use worker::WorkerShared;
