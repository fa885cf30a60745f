//! taskhive: an in-process task orchestration engine.
//!
//! Callers submit [`TaskSpec`]s to an [`Orchestrator`], which queues them by
//! priority, routes each to an I/O or CPU lane, runs them on an autoscaled
//! worker pool behind per-dependency circuit breakers, and hands back
//! [`TaskResult`]s in bulk or as a stream.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod queue;

pub use crate::config::Config;
pub use crate::core::{
    Backoff, Classification, FailureKind, Lane, Priority, RetryPolicy, TaskContext, TaskFailure,
    TaskId, TaskOutput, TaskPayload, TaskResult, TaskSpec, TaskStatus, WorkloadHint,
};
pub use error::{Error, Result};
pub use orchestration::{
    BreakerRegistry, CancelOutcome, CircuitState, HealthReport, HealthStatus, MetricsSink,
    Orchestrator, StatsSnapshot,
};
pub use queue::{MemoryQueueStore, QueueStore};
