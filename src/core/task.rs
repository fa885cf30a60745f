//! Task data model.
//!
//! A [`TaskSpec`] is what callers build and submit; the orchestrator turns it
//! into a [`Task`] by assigning an identifier, a submission timestamp, and the
//! lane chosen by the hybrid router.

use crate::core::payload::{FailureKind, TaskFailure, TaskPayload};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a submitted task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task priority. Higher variants always dequeue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, taken only when nothing else is waiting
    Low,
    /// Default for tasks that do not ask for anything else
    #[default]
    Normal,
    High,
    Critical,
    /// Jumps every other queued task
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
        Priority::Urgent,
    ];

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self> {
        Priority::ALL
            .get(level as usize)
            .copied()
            .ok_or_else(|| Error::Validation(format!("unrecognized priority level {level}")))
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::Validation(format!("unrecognized priority '{other}'"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Execution lane a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Cooperative lane: many tasks multiplexed per worker.
    Io,
    /// Parallel lane: one task per worker on a blocking thread.
    Cpu,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Io, Lane::Cpu];
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Io => write!(f, "io"),
            Lane::Cpu => write!(f, "cpu"),
        }
    }
}

/// How the caller classifies a task's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Waits on the network or disk; runs on the I/O lane
    IoBound,
    /// Burns CPU; runs on the CPU lane
    CpuBound,
    /// Let the router decide from the declared [`WorkloadHint`], falling back
    /// to the payload's shape.
    #[default]
    Auto,
}

/// Declared nature of a payload, consulted for [`Classification::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadHint {
    /// HTTP calls and other remote requests
    Network,
    /// File reads and writes
    Storage,
    /// Queries against a database
    Database,
    /// Number crunching
    Compute,
    /// Compression, hashing, and media encoding
    Encoding,
}

impl WorkloadHint {
    pub fn preferred_lane(&self) -> Lane {
        match self {
            WorkloadHint::Network | WorkloadHint::Storage | WorkloadHint::Database => Lane::Io,
            WorkloadHint::Compute | WorkloadHint::Encoding => Lane::Cpu,
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue, or waiting out a retry backoff
    Queued,
    /// An attempt is executing on a worker
    Running,
    /// Finished with an output
    Completed,
    /// Last attempt failed and no retries remain
    Failed,
    /// Cancelled by the caller or by shutdown
    Cancelled,
    /// Last attempt exceeded its timeout
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::TimedOut
        )
    }

    /// Terminal status recorded for a final failure of the given kind.
    pub fn for_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => TaskStatus::TimedOut,
            FailureKind::Cancelled => TaskStatus::Cancelled,
            FailureKind::Execution | FailureKind::CircuitOpen | FailureKind::WorkerLost => {
                TaskStatus::Failed
            }
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Delay before the attempt following `attempts_made` attempts.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(10))
    }
}

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::none(),
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide what happens after `attempts_made` attempts ended in `failure`.
    pub fn decide(&self, failure: &TaskFailure, attempts_made: u32) -> RetryDecision {
        if !failure.kind.is_retryable() || attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay_after(attempts_made),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// A task as described by the caller, before submission.
#[derive(Clone)]
pub struct TaskSpec {
    pub payload: TaskPayload,
    pub priority: Priority,
    pub classification: Classification,
    pub hint: Option<WorkloadHint>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Dependency whose circuit breaker guards every attempt.
    pub dependency: Option<String>,
    pub label: Option<String>,
}

impl TaskSpec {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: Priority::default(),
            classification: Classification::default(),
            hint: None,
            timeout: None,
            retry: RetryPolicy::default(),
            dependency: None,
            label: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn hint(mut self, hint: WorkloadHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependency = Some(name.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reject parameters that can never run.
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::Validation("timeout must be positive".to_string()));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation(
                "retry policy must allow at least one attempt".to_string(),
            ));
        }
        let multiplier = self.retry.backoff.multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(Error::Validation(format!(
                "backoff multiplier must be >= 1, got {multiplier}"
            )));
        }
        if let Some(dep) = &self.dependency {
            if dep.trim().is_empty() {
                return Err(Error::Validation(
                    "dependency name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("classification", &self.classification)
            .field("hint", &self.hint)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("dependency", &self.dependency)
            .field("label", &self.label)
            .finish()
    }
}

/// A submitted task, owned by the queue while waiting and by a worker while
/// running.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub lane: Lane,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub dependency: Option<String>,
    pub label: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Attempts started so far.
    pub attempts: u32,
    /// FIFO position within a priority; assigned by the queue on every enqueue.
    pub seq: u64,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, lane: Lane, default_timeout: Duration) -> Self {
        Self {
            id: TaskId::new(),
            payload: spec.payload,
            priority: spec.priority,
            lane,
            timeout: spec.timeout.unwrap_or(default_timeout),
            retry: spec.retry,
            dependency: spec.dependency,
            label: spec.label,
            submitted_at: Utc::now(),
            started_at: None,
            attempts: 0,
            seq: 0,
        }
    }

    /// Record the start of a new attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.attempts
    }
}
