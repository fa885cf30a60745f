//! Public entry point for submitting and collecting work.
//!
//! An [`Orchestrator`] is constructed explicitly and passed by reference; there
//! is no global instance. It owns the queue, ledger, result store, breakers and
//! worker pool, and while running it drives four background loops: the
//! autoscaler, the health monitor, the retention sweeper and the metrics
//! publisher.

use crate::config::Config;
use crate::core::payload::{FailureKind, TaskFailure, TaskOutput, TaskPayload};
use crate::core::result::TaskResult;
use crate::core::task::{Classification, Lane, Task, TaskId, TaskSpec, TaskStatus};
use crate::orchestration::autoscale::{Autoscaler, ScalePolicy};
use crate::orchestration::breaker::{BreakerRegistry, BreakerSettings};
use crate::orchestration::health::HealthMonitor;
use crate::orchestration::ledger::TaskLedger;
use crate::orchestration::pool::{WorkerHealth, WorkerPool};
use crate::orchestration::results::ResultAggregator;
use crate::orchestration::router::HybridRouter;
use crate::orchestration::stats::{
    breaker_health, ComponentHealth, HealthReport, HealthStatus, LaneStats, MetricsSink,
    StatsSnapshot, TaskCounters, TracingSink,
};
use crate::orchestration::worker::WorkerShared;
use crate::queue::{PriorityTaskQueue, QueueStore};
use crate::{Error, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const AUTOSCALER: &str = "autoscaler";
const HEALTH_MONITOR: &str = "health_monitor";
const SWEEPER: &str = "retention_sweeper";
const METRICS: &str = "metrics_publisher";

/// What a call to [`Orchestrator::cancel`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Taken off the queue (or out of retry backoff) before running again.
    Dequeued,
    /// Running on the I/O lane; its token was cancelled.
    Signalled,
    /// Running on the CPU lane; only its timeout can stop it.
    NotCancellable,
    /// Already finished. Nothing changed.
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running { since: Instant },
    Stopped,
}

/// Read-only handles used to assemble stats, shared with the metrics loop.
#[derive(Clone)]
struct Probe {
    lifecycle: Arc<Mutex<Lifecycle>>,
    queue: Arc<PriorityTaskQueue>,
    ledger: Arc<TaskLedger>,
    pool: Arc<WorkerPool>,
    counters: Arc<TaskCounters>,
    breakers: Arc<BreakerRegistry>,
}

impl Probe {
    fn snapshot(&self) -> StatsSnapshot {
        let lifecycle = *self.lifecycle.lock();
        let (running, uptime_secs) = match lifecycle {
            Lifecycle::Running { since } => (true, since.elapsed().as_secs_f64()),
            _ => (false, 0.0),
        };
        let load = self.pool.load();
        let lane_stats = |lane: Lane| {
            let lane_load = load.lane(lane);
            LaneStats {
                queue_depth: self.queue.lane_depth(lane),
                workers: lane_load.workers,
                busy_slots: lane_load.busy,
                total_slots: lane_load.slots,
            }
        };
        let io = lane_stats(Lane::Io);
        let cpu = lane_stats(Lane::Cpu);
        let queue_depth = io.queue_depth + cpu.queue_depth;

        let slots = load.slots();
        let utilization = if slots == 0 {
            0.0
        } else if load.busy() >= slots && queue_depth > 0 {
            1.0
        } else {
            load.busy() as f64 / slots as f64
        };

        let unresponsive_workers = self
            .pool
            .snapshots()
            .iter()
            .filter(|w| w.health == WorkerHealth::Unresponsive)
            .count();
        let counts = self.ledger.counts();

        StatsSnapshot {
            taken_at: Utc::now(),
            running,
            uptime_secs,
            queue_depth,
            io,
            cpu,
            workers: load.workers(),
            unresponsive_workers,
            utilization,
            tasks_queued: counts.queued,
            tasks_running: counts.running,
            totals: self.counters.totals(),
            breakers: self.breakers.snapshots(),
        }
    }
}

/// Coordinates submission, execution and retrieval of tasks.
pub struct Orchestrator {
    config: Config,
    probe: Probe,
    results: Arc<ResultAggregator>,
    shared: Arc<WorkerShared>,
    router: HybridRouter,
    sink: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    background: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Build an orchestrator backed by the in-memory queue store.
    pub fn new(config: Config) -> Result<Self> {
        let ledger = Arc::new(TaskLedger::new());
        let queue = PriorityTaskQueue::in_memory(Arc::clone(&ledger));
        Self::assemble(config, queue, ledger)
    }

    /// Build an orchestrator backed by a custom queue store.
    pub fn with_store(config: Config, store: Box<dyn QueueStore>) -> Result<Self> {
        let ledger = Arc::new(TaskLedger::new());
        let queue = PriorityTaskQueue::new(store, Arc::clone(&ledger));
        Self::assemble(config, queue, ledger)
    }

    /// Replace the default [`TracingSink`].
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    fn assemble(config: Config, queue: PriorityTaskQueue, ledger: Arc<TaskLedger>) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(queue);
        let results = Arc::new(ResultAggregator::new(config.stream_buffer));
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::from(&config)));
        let counters = Arc::new(TaskCounters::new());
        let shared = Arc::new(WorkerShared::new(
            Arc::clone(&queue),
            Arc::clone(&ledger),
            Arc::clone(&results),
            Arc::clone(&breakers),
            Arc::clone(&counters),
            config.max_concurrent_tasks,
            config.io_slots_per_worker,
            config.heartbeat_interval(),
        ));
        let shutdown = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&shared),
            &config,
            shutdown.child_token(),
        ));

        Ok(Self {
            probe: Probe {
                lifecycle: Arc::new(Mutex::new(Lifecycle::Created)),
                queue,
                ledger,
                pool,
                counters,
                breakers,
            },
            config,
            results,
            shared,
            router: HybridRouter::new(),
            sink: Arc::new(TracingSink),
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.probe.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Registry for calling external dependencies through their breakers.
    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.probe.breakers)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the queue, spawn `min_workers` and start the background loops.
    ///
    /// A queue store that fails to open aborts the start. An orchestrator
    /// cannot be restarted once stopped.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.probe.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running { .. } => return Err(Error::AlreadyStarted),
                Lifecycle::Stopped => return Err(Error::QueueClosed),
                Lifecycle::Created => {}
            }
            if let Err(err) = self.probe.queue.open() {
                error!(error = %err, "Queue store failed to open");
                return Err(err);
            }
            *lifecycle = Lifecycle::Running {
                since: Instant::now(),
            };
        }

        let workers = self.probe.pool.start();
        self.spawn_background();
        info!(
            workers = workers.len(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Orchestrator started"
        );
        Ok(())
    }

    fn spawn_background(&self) {
        let autoscaler = Autoscaler::new(
            ScalePolicy::from(&self.config),
            Arc::clone(&self.probe.pool),
            Arc::clone(&self.probe.queue),
            self.config.scale_interval(),
        );
        let monitor = HealthMonitor::new(
            Arc::clone(&self.probe.pool),
            Arc::clone(&self.shared),
            self.config.liveness_grace(),
            self.config.health_interval(),
        );

        let mut background = self.background.lock();
        background.push((
            AUTOSCALER,
            tokio::spawn(autoscaler.run(self.shutdown.clone())),
        ));
        background.push((
            HEALTH_MONITOR,
            tokio::spawn(monitor.run(self.shutdown.clone())),
        ));
        background.push((
            SWEEPER,
            tokio::spawn(sweep_loop(
                Arc::clone(&self.probe.ledger),
                Arc::clone(&self.results),
                self.config.result_retention(),
                self.shutdown.clone(),
            )),
        ));
        background.push((
            METRICS,
            tokio::spawn(publish_loop(
                self.probe.clone(),
                Arc::clone(&self.sink),
                self.config.metrics_interval(),
                self.shutdown.clone(),
            )),
        ));
    }

    /// Stop accepting work and shut the pool down.
    ///
    /// Tasks still queued are cancelled, pending retries keep their last
    /// failure, and running tasks get `shutdown_grace` to finish before their
    /// workers are aborted and the tasks recorded as lost.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.probe.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => return Err(Error::NotStarted),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Running { .. } => *lifecycle = Lifecycle::Stopped,
            }
        }
        info!("Stopping orchestrator");

        self.probe.queue.close();
        let queued = match self.probe.queue.drain() {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "Failed to drain queue store");
                Vec::new()
            }
        };
        let cancelled = queued.len();
        for task in queued {
            let failure = TaskFailure::new(FailureKind::Cancelled, "orchestrator shutdown");
            self.shared.finalize(TaskResult::failed(&task, failure));
        }
        let mut abandoned = self.shared.abandon_retries();

        self.shutdown.cancel();
        let loops: Vec<(&'static str, JoinHandle<()>)> =
            self.background.lock().drain(..).collect();
        for (name, join) in loops {
            if let Err(err) = join.await {
                warn!(task = name, error = %err, "Background loop ended abnormally");
            }
        }

        let lost = self.probe.pool.shutdown(self.config.shutdown_grace()).await;
        let lost_count = lost.len();
        for task in lost {
            let failure = TaskFailure::new(FailureKind::WorkerLost, "worker terminated at shutdown");
            self.shared.finalize(TaskResult::failed(&task, failure));
        }
        // Attempts that failed during the grace period may have scheduled retries.
        abandoned += self.shared.abandon_retries();

        info!(
            cancelled,
            abandoned_retries = abandoned,
            lost = lost_count,
            "Orchestrator stopped"
        );
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.probe.lifecycle.lock() {
            Lifecycle::Running { .. } => Ok(()),
            Lifecycle::Created => Err(Error::NotStarted),
            Lifecycle::Stopped => Err(Error::QueueClosed),
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Validate, route and enqueue one task. Returns as soon as it is queued.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        self.ensure_running()?;
        spec.validate()?;
        let task = self.prepare(spec);
        let id = task.id;
        self.probe.ledger.register(&task);

        if let Err(err) = self.probe.queue.enqueue(task) {
            self.forget(&id);
            return Err(err);
        }
        self.probe.counters.submitted(1);
        Ok(id)
    }

    /// Submit a batch. Every spec is validated before any is queued, and the
    /// returned ids follow submission order.
    pub fn submit_many(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        self.ensure_running()?;
        for (index, spec) in specs.iter().enumerate() {
            spec.validate().map_err(|err| match err {
                Error::Validation(msg) => Error::Validation(format!("task {index}: {msg}")),
                other => other,
            })?;
        }

        let tasks: Vec<Task> = specs.into_iter().map(|spec| self.prepare(spec)).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        for task in &tasks {
            self.probe.ledger.register(task);
        }
        if let Err(err) = self.probe.queue.enqueue_all(tasks) {
            for id in &ids {
                self.forget(id);
            }
            return Err(err);
        }
        self.probe.counters.submitted(ids.len() as u64);
        debug!(count = ids.len(), "Batch submitted");
        Ok(ids)
    }

    fn prepare(&self, spec: TaskSpec) -> Task {
        let lane = self.router.route(&spec);
        let task = Task::from_spec(spec, lane, self.config.task_timeout());
        debug!(
            task_id = %task.id,
            priority = %task.priority,
            lane = %lane,
            "Task submitted"
        );
        task
    }

    /// Drop the ledger entry of a task that never made it onto the queue.
    fn forget(&self, id: &TaskId) {
        self.probe.ledger.mark_terminal(id, TaskStatus::Cancelled, 0);
        self.probe.ledger.evict(id);
    }

    /// Run a blocking function over `items` on the CPU lane.
    ///
    /// Results come back in item order once every task is terminal.
    pub async fn map<F, T>(&self, f: F, items: Vec<T>) -> Result<Vec<TaskResult>>
    where
        F: Fn(T) -> TaskOutput + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let specs = items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                TaskSpec::new(TaskPayload::blocking(move || f(item.clone())))
                    .classification(Classification::CpuBound)
            })
            .collect();
        let ids = self.submit_many(specs)?;
        self.get_results(&ids, None).await
    }

    /// Run an async function over `items` on the I/O lane, in item order.
    pub async fn map_async<F, Fut, T>(&self, f: F, items: Vec<T>) -> Result<Vec<TaskResult>>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let specs = items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                TaskSpec::new(TaskPayload::future(move |_ctx| f(item.clone())))
                    .classification(Classification::IoBound)
            })
            .collect();
        let ids = self.submit_many(specs)?;
        self.get_results(&ids, None).await
    }

    // =========================================================================
    // Retrieval
    // =========================================================================

    /// Wait for every id to reach a terminal state, returning results in
    /// `ids` order.
    ///
    /// On timeout the unfinished ids come back as queued or running
    /// snapshots. Terminal ids stay retrievable until the retention window
    /// passes, so repeating the call returns the same results.
    pub async fn get_results(
        &self,
        ids: &[TaskId],
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskResult>> {
        let mut known = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(view) = self.probe.ledger.view(id) {
                known.insert(*id, view);
            } else if !self.results.contains(id) {
                return Err(Error::UnknownTask(*id));
            }
        }

        let ledger = &self.probe.ledger;
        let results = self
            .results
            .gather(ids, timeout, |id| {
                let view = ledger.view(id).or_else(|| known.get(id).copied());
                match view {
                    Some(view) => TaskResult::pending(*id, view.status, view.lane, view.attempts),
                    None => TaskResult::pending(*id, TaskStatus::Queued, Lane::Io, 0),
                }
            })
            .await;

        for result in results.iter().filter(|r| r.is_terminal()) {
            ledger.evict(&result.task_id);
        }
        Ok(results)
    }

    /// Lazily stream results for `ids` in completion order.
    ///
    /// The stream ends after the last id has been yielded. Dropping it early
    /// leaves the tasks and their results untouched.
    pub fn stream_results(
        &self,
        ids: &[TaskId],
    ) -> Result<impl Stream<Item = TaskResult> + Send + 'static> {
        if let Some(unknown) = ids
            .iter()
            .find(|id| self.probe.ledger.status(id).is_none() && !self.results.contains(id))
        {
            return Err(Error::UnknownTask(*unknown));
        }
        let ledger = Arc::clone(&self.probe.ledger);
        Ok(self.results.stream(ids).inspect(move |result| {
            ledger.evict(&result.task_id);
        }))
    }

    /// Current status of a task, if it is still known.
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.probe
            .ledger
            .status(&id)
            .or_else(|| self.results.get(&id).map(|result| result.status))
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a task.
    ///
    /// Queued tasks (including ones waiting out a retry backoff) are removed
    /// and recorded as cancelled without running again. Running I/O tasks are
    /// signalled and stop at their next suspension point. CPU tasks cannot be
    /// interrupted once started.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        if let Some(task) = self.shared.take_retry(&id) {
            self.finalize_cancelled(&task, "cancelled while awaiting retry");
            return Ok(CancelOutcome::Dequeued);
        }
        if let Some(task) = self.probe.queue.remove(&id)? {
            self.finalize_cancelled(&task, "cancelled before start");
            return Ok(CancelOutcome::Dequeued);
        }

        let Some(view) = self.probe.ledger.view(&id) else {
            return if self.results.contains(&id) {
                Ok(CancelOutcome::AlreadyTerminal)
            } else {
                Err(Error::UnknownTask(id))
            };
        };
        if view.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        match view.lane {
            Lane::Io => {
                if let Some(token) = self.probe.ledger.cancel_token(&id) {
                    token.cancel();
                }
                debug!(task_id = %id, status = %view.status, "Cancellation signalled");
                Ok(CancelOutcome::Signalled)
            }
            Lane::Cpu => {
                debug!(task_id = %id, "CPU task is not cancellable while running");
                Ok(CancelOutcome::NotCancellable)
            }
        }
    }

    fn finalize_cancelled(&self, task: &Task, reason: &str) {
        debug!(task_id = %task.id, reason, "Task cancelled");
        let failure = TaskFailure::new(FailureKind::Cancelled, reason);
        self.shared.finalize(TaskResult::failed(task, failure));
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub async fn get_stats(&self) -> StatsSnapshot {
        self.probe.snapshot()
    }

    pub async fn health_check(&self) -> HealthReport {
        let stats = self.probe.snapshot();
        let running = stats.running;
        let closed = self.probe.queue.is_closed();

        let queue = if !running {
            ComponentHealth::new("queue", HealthStatus::Unhealthy, "orchestrator not running")
        } else if closed {
            ComponentHealth::new("queue", HealthStatus::Unhealthy, "closed")
        } else {
            ComponentHealth::new(
                "queue",
                HealthStatus::Healthy,
                format!("open, {} waiting", stats.queue_depth),
            )
        };

        let workers_detail = format!(
            "{} live, {} unresponsive",
            stats.workers, stats.unresponsive_workers
        );
        let workers = if !running || stats.workers == 0 {
            ComponentHealth::new("workers", HealthStatus::Unhealthy, workers_detail)
        } else if stats.unresponsive_workers > 0 {
            ComponentHealth::new("workers", HealthStatus::Degraded, workers_detail)
        } else {
            ComponentHealth::new("workers", HealthStatus::Healthy, workers_detail)
        };

        let autoscaler = match self.loop_alive(AUTOSCALER) {
            Some(true) => ComponentHealth::new(
                "autoscaler",
                HealthStatus::Healthy,
                format!("every {:?}", self.config.scale_interval()),
            ),
            Some(false) => {
                ComponentHealth::new("autoscaler", HealthStatus::Unhealthy, "control loop exited")
            }
            None => ComponentHealth::new("autoscaler", HealthStatus::Unhealthy, "not running"),
        };

        let results = ComponentHealth::new(
            "results",
            HealthStatus::Healthy,
            format!(
                "{} stored, {} tracked",
                self.results.len(),
                self.probe.ledger.len()
            ),
        );

        HealthReport::from_components(vec![
            queue,
            workers,
            autoscaler,
            breaker_health(&stats.breakers),
            results,
        ])
    }

    fn loop_alive(&self, name: &str) -> Option<bool> {
        self.background
            .lock()
            .iter()
            .find(|(loop_name, _)| *loop_name == name)
            .map(|(_, join)| !join.is_finished())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("lifecycle", &*self.probe.lifecycle.lock())
            .field("pool", &self.probe.pool)
            .field("queue", &self.probe.queue)
            .finish_non_exhaustive()
    }
}

async fn sweep_loop(
    ledger: Arc<TaskLedger>,
    results: Arc<ResultAggregator>,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let period = (retention / 4).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = ledger.sweep(retention).len();
                let dropped = results.sweep(retention);
                if evicted + dropped > 0 {
                    debug!(evicted, dropped, "Retention sweep");
                }
            }
        }
    }
}

async fn publish_loop(
    probe: Probe,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => sink.publish(&probe.snapshot()),
        }
    }
}
