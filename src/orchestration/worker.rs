//! Worker loops, attempt execution, and result settlement.
//!
//! Each worker runs one loop that heartbeats, pulls tasks for its lane, and
//! runs attempts in a `JoinSet` sized by its slot count: many slots for an
//! I/O worker, one for a CPU worker. Blocking payloads, and async payloads
//! routed to the CPU lane, go to `spawn_blocking`; a timed-out blocking call
//! is detached and its eventual output discarded. Async payloads on the I/O
//! lane are raced against their timeout and the caller's cancellation token.
//!
//! Settlement is exactly-once: whoever removes a task from its worker's
//! in-flight map (the attempt itself, the health monitor, or shutdown) is the
//! one that finalizes or retries it.

use crate::core::payload::{FailureKind, TaskContext, TaskFailure, TaskOutput, TaskPayload};
use crate::core::result::TaskResult;
use crate::core::task::{Lane, RetryDecision, Task, TaskId};
use crate::orchestration::breaker::{BreakerError, BreakerRegistry};
use crate::orchestration::ledger::TaskLedger;
use crate::orchestration::pool::{PoolEvent, Registry, WorkerHandle, WorkerHealth};
use crate::orchestration::results::ResultAggregator;
use crate::orchestration::stats::TaskCounters;
use crate::queue::PriorityTaskQueue;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A failed task waiting out its backoff before going back on the queue.
#[derive(Debug)]
struct PendingRetry {
    task: Task,
    failure: TaskFailure,
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerShared {
    pub queue: Arc<PriorityTaskQueue>,
    pub ledger: Arc<TaskLedger>,
    pub results: Arc<ResultAggregator>,
    pub breakers: Arc<BreakerRegistry>,
    pub counters: Arc<TaskCounters>,
    /// Caps attempts running at once across all workers.
    pub permits: Arc<Semaphore>,
    pub io_slots: usize,
    pub heartbeat_interval: Duration,
    retrying: Mutex<HashMap<TaskId, PendingRetry>>,
}

impl WorkerShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PriorityTaskQueue>,
        ledger: Arc<TaskLedger>,
        results: Arc<ResultAggregator>,
        breakers: Arc<BreakerRegistry>,
        counters: Arc<TaskCounters>,
        max_concurrent_tasks: usize,
        io_slots: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            results,
            breakers,
            counters,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
            io_slots,
            heartbeat_interval,
            retrying: Mutex::new(HashMap::new()),
        }
    }

    /// Record the terminal result of `task`.
    ///
    /// The ledger goes terminal before the result is published, so a waiter
    /// woken by the completion can evict the entry straight away.
    pub fn finalize(&self, result: TaskResult) {
        let status = result.status;
        self.ledger
            .mark_terminal(&result.task_id, status, result.attempts);
        if self.results.record(result) {
            self.counters.finished(status);
        }
    }

    /// Settle the outcome of one attempt.
    pub fn settle(self: &Arc<Self>, task: Task, output: TaskOutput) {
        match output {
            Ok(value) => {
                debug!(task_id = %task.id, attempts = task.attempts, "Task completed");
                self.finalize(TaskResult::completed(&task, value));
            }
            Err(failure) => self.fail(task, failure),
        }
    }

    /// Consult the retry policy for a failed attempt.
    pub fn fail(self: &Arc<Self>, task: Task, failure: TaskFailure) {
        match task.retry.decide(&failure, task.attempts) {
            RetryDecision::GiveUp => {
                debug!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    error = %failure,
                    "Task failed"
                );
                self.finalize(TaskResult::failed(&task, failure));
            }
            RetryDecision::Retry { delay } => self.schedule_retry(task, failure, delay),
        }
    }

    /// Remove a task waiting to be retried, if there is one.
    ///
    /// Callers looking for a not-yet-running task must try this before
    /// `queue.remove`: the retry timer holds this lock across its re-enqueue,
    /// so a miss here means the task is already back on the queue.
    pub fn take_retry(&self, id: &TaskId) -> Option<Task> {
        self.retrying.lock().remove(id).map(|pending| pending.task)
    }

    /// Finalize every pending retry with its last failure.
    pub fn abandon_retries(&self) -> usize {
        let pending: Vec<PendingRetry> = self.retrying.lock().drain().map(|(_, p)| p).collect();
        let count = pending.len();
        for PendingRetry { task, failure } in pending {
            self.finalize(TaskResult::failed(&task, failure));
        }
        count
    }

    pub fn retries_pending(&self) -> usize {
        self.retrying.lock().len()
    }

    fn schedule_retry(self: &Arc<Self>, task: Task, failure: TaskFailure, delay: Duration) {
        let id = task.id;
        info!(
            task_id = %id,
            attempt = task.attempts,
            max_attempts = task.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Retrying task"
        );
        self.counters.retried();
        self.ledger.mark_queued(&id);
        self.retrying.lock().insert(id, PendingRetry { task, failure });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let rejected = {
                let mut retrying = shared.retrying.lock();
                // Gone means it was cancelled or abandoned at shutdown meanwhile.
                let Some(PendingRetry { task, failure }) = retrying.remove(&id) else {
                    return;
                };
                match shared.queue.enqueue(task.clone()) {
                    Ok(()) => None,
                    Err(err) => Some((task, failure, err)),
                }
            };
            if let Some((task, failure, err)) = rejected {
                debug!(task_id = %id, error = %err, "Retry not re-enqueued, keeping last failure");
                shared.finalize(TaskResult::failed(&task, failure));
            }
        });
    }
}

impl std::fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShared")
            .field("io_slots", &self.io_slots)
            .field("available_permits", &self.permits.available_permits())
            .field("retries_pending", &self.retries_pending())
            .finish_non_exhaustive()
    }
}

/// Main loop for one worker.
pub(crate) async fn run(
    shared: Arc<WorkerShared>,
    handle: Arc<WorkerHandle>,
    registry: Arc<Registry>,
    events: broadcast::Sender<PoolEvent>,
) {
    let mut attempts: JoinSet<()> = JoinSet::new();
    let mut heartbeat = tokio::time::interval(shared.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let retire = handle.retire_token().clone();

    loop {
        let accepting = attempts.len() < handle.slots && !retire.is_cancelled();
        if !accepting && attempts.is_empty() {
            break;
        }

        tokio::select! {
            _ = heartbeat.tick() => handle.beat(),
            Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                handle.beat();
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(worker_id = %handle.id, "Attempt task panicked");
                    }
                }
            }
            next = shared.queue.dequeue(handle.lane, &retire), if accepting => {
                handle.beat();
                match next {
                    Ok(Some(task)) => {
                        let cancel = shared
                            .ledger
                            .cancel_token(&task.id)
                            .map(|token| token.child_token())
                            .unwrap_or_default();
                        handle.track(task.clone());
                        attempts.spawn(attempt(
                            Arc::clone(&shared),
                            Arc::clone(&handle),
                            task,
                            cancel,
                        ));
                    }
                    // Closed queue or retirement: stop taking work, drain, exit.
                    Ok(None) => retire.cancel(),
                    Err(err) => {
                        error!(worker_id = %handle.id, error = %err, "Dequeue failed");
                        tokio::time::sleep(shared.heartbeat_interval).await;
                    }
                }
            }
        }
    }

    {
        let mut workers = registry.write();
        if workers
            .get(&handle.id)
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            workers.remove(&handle.id);
        }
    }
    handle.set_health(WorkerHealth::Terminated);
    debug!(worker_id = %handle.id, lane = %handle.lane, "Worker exited");
    let _ = events.send(PoolEvent::Exited {
        worker_id: handle.id,
    });
}

/// Run one attempt and settle it if this worker still owns the task.
async fn attempt(
    shared: Arc<WorkerShared>,
    handle: Arc<WorkerHandle>,
    task: Task,
    cancel: CancellationToken,
) {
    let permit = Arc::clone(&shared.permits).acquire_owned().await.ok();
    let output = execute(&task, cancel.clone(), &shared.breakers).await;
    cancel.cancel();
    drop(permit);

    if handle.take_in_flight(&task.id).is_some() {
        shared.settle(task, output);
    }
}

/// Execute a single attempt of `task` with its timeout, dependency breaker,
/// and (on the I/O lane) cooperative cancellation applied.
pub(crate) async fn execute(
    task: &Task,
    cancel: CancellationToken,
    breakers: &Arc<BreakerRegistry>,
) -> TaskOutput {
    let ctx = TaskContext::new(task.id, task.attempts, cancel.clone(), Arc::clone(breakers));
    let invocation = invoke(task.payload.clone(), task.lane, ctx);
    let guarded = async {
        match &task.dependency {
            Some(dependency) => breakers
                .get(dependency)
                .call(|| invocation)
                .await
                .map_err(|err| match err {
                    BreakerError::Open { name } => TaskFailure::new(
                        FailureKind::CircuitOpen,
                        format!("circuit '{name}' is open"),
                    ),
                    BreakerError::Inner(failure) => failure,
                }),
            None => invocation.await,
        }
    };

    let cancellable = task.lane == Lane::Io;
    tokio::select! {
        biased;
        _ = cancel.cancelled(), if cancellable => {
            debug!(task_id = %task.id, "Task cancelled while running");
            Err(TaskFailure::new(FailureKind::Cancelled, "cancelled while running"))
        }
        outcome = tokio::time::timeout(task.timeout, guarded) => match outcome {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    lane = %task.lane,
                    timeout_ms = task.timeout.as_millis() as u64,
                    "Task timed out"
                );
                Err(TaskFailure::new(
                    FailureKind::Timeout,
                    format!("exceeded timeout of {:?}", task.timeout),
                ))
            }
        },
    }
}

/// Run the payload. Anything on the CPU lane, async or not, gets its own
/// blocking thread so a timeout can detach it instead of waiting on it.
async fn invoke(payload: TaskPayload, lane: Lane, ctx: TaskContext) -> TaskOutput {
    match payload {
        TaskPayload::Blocking(f) => on_blocking_thread(move || f()).await,
        TaskPayload::Async(f) if lane == Lane::Cpu => {
            let runtime = tokio::runtime::Handle::current();
            on_blocking_thread(move || runtime.block_on(f(ctx))).await
        }
        TaskPayload::Async(f) => {
            let call = AssertUnwindSafe(async move { f(ctx).await });
            match call.catch_unwind().await {
                Ok(output) => output,
                Err(panic) => Err(TaskFailure::execution(format!(
                    "payload panicked: {}",
                    panic_message(panic)
                ))),
            }
        }
    }
}

async fn on_blocking_thread<F>(f: F) -> TaskOutput
where
    F: FnOnce() -> TaskOutput + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(output) => output,
        Err(err) if err.is_panic() => Err(TaskFailure::execution(format!(
            "payload panicked: {}",
            panic_message(err.into_panic())
        ))),
        Err(err) => Err(TaskFailure::new(FailureKind::WorkerLost, err.to_string())),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
