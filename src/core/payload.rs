//! Task payloads and the explicit success/failure type they return.
//!
//! Payloads never signal failure by panicking: they return a [`TaskOutput`],
//! and the retry policy inspects the [`FailureKind`] of any failure.

use crate::core::task::{Lane, TaskId};
use crate::orchestration::breaker::{BreakerError, BreakerRegistry};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one payload invocation.
pub type TaskOutput = std::result::Result<serde_json::Value, TaskFailure>;

type BlockingFn = dyn Fn() -> TaskOutput + Send + Sync;
type AsyncFn = dyn Fn(TaskContext) -> BoxFuture<'static, TaskOutput> + Send + Sync;

/// Why an attempt did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The payload itself reported an error (or panicked).
    Execution,
    /// A circuit breaker rejected the call.
    CircuitOpen,
    /// The attempt exceeded its timeout.
    Timeout,
    /// The worker running the attempt became unresponsive.
    WorkerLost,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Cancelled)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Execution => write!(f, "execution error"),
            FailureKind::CircuitOpen => write!(f, "circuit open"),
            FailureKind::Timeout => write!(f, "task timeout"),
            FailureKind::WorkerLost => write!(f, "worker lost"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::execution(err.to_string())
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E: std::fmt::Display> From<BreakerError<E>> for TaskFailure {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { .. } => Self::new(FailureKind::CircuitOpen, err.to_string()),
            BreakerError::Inner(inner) => Self::execution(inner.to_string()),
        }
    }
}

/// The callable part of a task.
///
/// Payloads are `Fn` rather than `FnOnce` so a retry can invoke them again.
#[derive(Clone)]
pub enum TaskPayload {
    /// Synchronous work, run on a blocking thread.
    Blocking(Arc<BlockingFn>),
    /// Asynchronous work. Polled cooperatively on the I/O lane; driven to
    /// completion on a blocking thread on the CPU lane.
    Async(Arc<AsyncFn>),
}

impl TaskPayload {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> TaskOutput + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    /// Lane implied by the payload's shape alone.
    pub fn natural_lane(&self) -> Lane {
        match self {
            TaskPayload::Blocking(_) => Lane::Cpu,
            TaskPayload::Async(_) => Lane::Io,
        }
    }
}

impl std::fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPayload::Blocking(_) => write!(f, "TaskPayload::Blocking"),
            TaskPayload::Async(_) => write!(f, "TaskPayload::Async"),
        }
    }
}

/// Handed to async payloads for each attempt.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub attempt: u32,
    cancel: CancellationToken,
    breakers: Arc<BreakerRegistry>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        cancel: CancellationToken,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
            breakers,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task has been cancelled or has timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Invoke an external dependency through its circuit breaker.
    pub async fn call<T, E, Fut>(
        &self,
        dependency: &str,
        fut: Fut,
    ) -> std::result::Result<T, TaskFailure>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let breaker = self.breakers.get(dependency);
        breaker.call(|| fut).await.map_err(TaskFailure::from)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
