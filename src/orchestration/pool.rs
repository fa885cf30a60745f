//! Worker pool for lane-aware task execution.
//!
//! The `WorkerPool` owns the worker registry: every live worker's handle,
//! indexed by id. Scale-up, idle retirement, and health replacement all
//! mutate the registry under its write lock, so a replacement is never lost
//! to a concurrent scale-down and the live count never dips below the floor.
//! Lifecycle changes are broadcast as [`PoolEvent`]s.

use crate::config::Config;
use crate::core::task::{Lane, Task, TaskId};
use crate::orchestration::worker::{self, WorkerShared};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Heartbeating on schedule
    Healthy,
    /// Missed its heartbeat grace; about to be replaced
    Unresponsive,
    /// Retired or shut down; no longer counted as live.
    Terminated,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Healthy => write!(f, "healthy"),
            WorkerHealth::Unresponsive => write!(f, "unresponsive"),
            WorkerHealth::Terminated => write!(f, "terminated"),
        }
    }
}

/// Events emitted by the pool for worker lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A worker started its loop
    Spawned {
        worker_id: WorkerId,
        lane: Lane,
    },
    /// An idle worker was told to stop taking work
    Retired {
        worker_id: WorkerId,
        lane: Lane,
    },
    /// An unresponsive worker was removed and a fresh one took its place.
    Replaced {
        /// The worker that stopped responding
        old: WorkerId,
        /// Its replacement, on the same lane
        new: WorkerId,
        lane: Lane,
        /// Tasks it held, now failed with `WorkerLost`
        lost_tasks: usize,
    },
    /// A worker loop returned
    Exited {
        worker_id: WorkerId,
    },
}

/// Shared state for one worker.
///
/// The loop owns the task side; the pool and health monitor observe it
/// through the heartbeat and the in-flight map. Removing a task from the
/// in-flight map is what entitles the caller to finalize it.
pub struct WorkerHandle {
    pub id: WorkerId,
    /// Lane this worker pulls from, fixed for its lifetime
    pub lane: Lane,
    /// Attempts it may run at once (1 on the CPU lane)
    pub slots: usize,
    pub spawned_at: DateTime<Utc>,
    /// Reference point for `last_beat_ms`
    epoch: Instant,
    /// Milliseconds since `epoch` at the last heartbeat
    last_beat_ms: AtomicU64,
    health: Mutex<WorkerHealth>,
    /// Child of the pool's shutdown token; cancelled to retire this worker
    retire: CancellationToken,
    /// Tasks with an attempt running here
    in_flight: Mutex<HashMap<TaskId, Task>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(lane: Lane, slots: usize, retire: CancellationToken) -> Self {
        Self {
            id: WorkerId::new(),
            lane,
            slots,
            spawned_at: Utc::now(),
            epoch: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
            health: Mutex::new(WorkerHealth::Healthy),
            retire,
            in_flight: Mutex::new(HashMap::new()),
            join: Mutex::new(None),
        }
    }

    /// Record liveness.
    pub fn beat(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_beat_ms.store(now, Ordering::Relaxed);
    }

    pub fn silent_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_beat_ms.load(Ordering::Relaxed)))
    }

    pub fn health(&self) -> WorkerHealth {
        *self.health.lock()
    }

    pub fn set_health(&self, health: WorkerHealth) {
        *self.health.lock() = health;
    }

    pub fn is_live(&self) -> bool {
        self.health() != WorkerHealth::Terminated
    }

    pub fn retire_token(&self) -> &CancellationToken {
        &self.retire
    }

    pub fn busy(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.lock().is_empty()
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.in_flight.lock().keys().copied().collect()
    }

    pub(crate) fn track(&self, task: Task) {
        self.in_flight.lock().insert(task.id, task);
    }

    pub(crate) fn take_in_flight(&self, id: &TaskId) -> Option<Task> {
        self.in_flight.lock().remove(id)
    }

    pub(crate) fn drain_in_flight(&self) -> Vec<Task> {
        self.in_flight.lock().drain().map(|(_, task)| task).collect()
    }

    pub(crate) fn attach(&self, join: JoinHandle<()>) {
        *self.join.lock() = Some(join);
    }

    /// True when the loop has ended, for whatever reason.
    pub fn has_exited(&self) -> bool {
        self.join
            .lock()
            .as_ref()
            .is_some_and(|join| join.is_finished())
    }

    pub(crate) fn abort(&self) {
        if let Some(join) = self.join.lock().as_ref() {
            join.abort();
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            lane: self.lane,
            health: self.health(),
            busy: self.busy(),
            slots: self.slots,
            silent_for_ms: self.silent_for().as_millis() as u64,
            spawned_at: self.spawned_at,
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .field("health", &self.health())
            .field("busy", &self.busy())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub lane: Lane,
    pub health: WorkerHealth,
    pub busy: usize,
    pub slots: usize,
    pub silent_for_ms: u64,
    pub spawned_at: DateTime<Utc>,
}

/// Busy and total slots for one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneLoad {
    pub workers: usize,
    pub busy: usize,
    pub slots: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLoad {
    pub io: LaneLoad,
    pub cpu: LaneLoad,
}

impl PoolLoad {
    pub fn lane(&self, lane: Lane) -> LaneLoad {
        match lane {
            Lane::Io => self.io,
            Lane::Cpu => self.cpu,
        }
    }

    pub fn workers(&self) -> usize {
        self.io.workers + self.cpu.workers
    }

    pub fn busy(&self) -> usize {
        self.io.busy + self.cpu.busy
    }

    pub fn slots(&self) -> usize {
        self.io.slots + self.cpu.slots
    }
}

pub(crate) type Registry = RwLock<HashMap<WorkerId, Arc<WorkerHandle>>>;

/// Manages the set of workers for both lanes.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    min_workers: usize,
    max_workers: usize,
    events: broadcast::Sender<PoolEvent>,
}

impl WorkerPool {
    pub fn new(shared: Arc<WorkerShared>, config: &Config, shutdown: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared,
            registry: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn the initial `min_workers`, alternating lanes so each lane has
    /// at least one worker.
    pub fn start(&self) -> Vec<WorkerId> {
        let mut workers = self.registry.write();
        let lanes = Lane::ALL.iter().cycle().take(self.min_workers);
        let ids: Vec<WorkerId> = lanes
            .map(|lane| self.spawn_locked(&mut workers, *lane))
            .collect();
        info!(workers = ids.len(), "Worker pool started");
        ids
    }

    /// Add up to `count` workers to `lane` without exceeding `max_workers`.
    pub fn scale_up(&self, lane: Lane, count: usize) -> Vec<WorkerId> {
        let mut workers = self.registry.write();
        let room = self.max_workers.saturating_sub(live_count(&workers));
        (0..count.min(room))
            .map(|_| self.spawn_locked(&mut workers, lane))
            .collect()
    }

    /// Retire up to `count` idle workers, never dropping below `min_workers`
    /// or leaving a lane without a worker. Busy workers are never chosen.
    pub fn retire_idle(&self, count: usize) -> Vec<WorkerId> {
        let workers = self.registry.write();
        let mut live = live_count(&workers);
        let mut per_lane: HashMap<Lane, usize> = HashMap::new();
        for handle in workers.values().filter(|h| h.is_live()) {
            *per_lane.entry(handle.lane).or_default() += 1;
        }

        let mut idle: Vec<&Arc<WorkerHandle>> = workers
            .values()
            .filter(|h| h.health() == WorkerHealth::Healthy && h.is_idle())
            .collect();
        // Youngest first, so long-lived workers stay.
        idle.sort_by(|a, b| b.spawned_at.cmp(&a.spawned_at));

        let mut retired = Vec::new();
        for handle in idle {
            if retired.len() >= count || live <= self.min_workers {
                break;
            }
            let lane_live = per_lane.entry(handle.lane).or_default();
            if *lane_live <= 1 {
                continue;
            }
            *lane_live -= 1;
            live -= 1;
            handle.set_health(WorkerHealth::Terminated);
            handle.retire.cancel();
            debug!(worker_id = %handle.id, lane = %handle.lane, "Retiring idle worker");
            let _ = self.events.send(PoolEvent::Retired {
                worker_id: handle.id,
                lane: handle.lane,
            });
            retired.push(handle.id);
        }
        retired
    }

    /// Replace a worker that stopped responding.
    ///
    /// The old worker is aborted and removed and a new worker on the same lane
    /// is spawned in the same critical section, regardless of `max_workers`.
    /// Returns the replacement id and the tasks the old worker held; the
    /// caller is responsible for failing those tasks.
    pub fn replace(&self, id: &WorkerId) -> Option<(WorkerId, Vec<Task>)> {
        let mut workers = self.registry.write();
        let old = workers.remove(id)?;
        let was_retiring = old.health() == WorkerHealth::Terminated;
        old.set_health(WorkerHealth::Unresponsive);
        old.abort();
        let lost = old.drain_in_flight();

        if was_retiring || self.shutdown.is_cancelled() {
            old.set_health(WorkerHealth::Terminated);
            return Some((old.id, lost));
        }

        let new = self.spawn_locked(&mut workers, old.lane);
        old.set_health(WorkerHealth::Terminated);
        self.shared.counters.worker_replaced();
        warn!(
            old = %old.id,
            new = %new,
            lane = %old.lane,
            lost_tasks = lost.len(),
            "Replaced unresponsive worker"
        );
        let _ = self.events.send(PoolEvent::Replaced {
            old: old.id,
            new,
            lane: old.lane,
            lost_tasks: lost.len(),
        });
        Some((new, lost))
    }

    /// Workers silent longer than `grace`, or whose loop ended while they
    /// were still supposed to be running.
    pub fn unresponsive(&self, grace: Duration) -> Vec<WorkerId> {
        self.registry
            .read()
            .values()
            .filter(|h| h.is_live())
            .filter(|h| h.silent_for() > grace || h.has_exited())
            .map(|h| h.id)
            .collect()
    }

    pub fn mark_unresponsive(&self, id: &WorkerId) {
        if let Some(handle) = self.registry.read().get(id) {
            handle.set_health(WorkerHealth::Unresponsive);
        }
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerHandle>> {
        self.registry.read().get(id).cloned()
    }

    pub fn live_count(&self) -> usize {
        live_count(&self.registry.read())
    }

    pub fn lane_count(&self, lane: Lane) -> usize {
        self.registry
            .read()
            .values()
            .filter(|h| h.is_live() && h.lane == lane)
            .count()
    }

    pub fn load(&self) -> PoolLoad {
        let mut load = PoolLoad::default();
        for handle in self.registry.read().values().filter(|h| h.is_live()) {
            let lane = match handle.lane {
                Lane::Io => &mut load.io,
                Lane::Cpu => &mut load.cpu,
            };
            lane.workers += 1;
            lane.busy += handle.busy().min(handle.slots);
            lane.slots += handle.slots;
        }
        load
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<WorkerSnapshot> = self
            .registry
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at));
        snapshots
    }

    /// Stop every worker.
    ///
    /// Workers stop taking tasks at once and get `grace` to finish what they
    /// hold. Whatever is still running afterwards is aborted and returned.
    pub async fn shutdown(&self, grace: Duration) -> Vec<Task> {
        self.shutdown.cancel();
        let handles: Vec<Arc<WorkerHandle>> = self.registry.read().values().cloned().collect();
        let mut joins: Vec<JoinHandle<()>> =
            handles.iter().filter_map(|h| h.join.lock().take()).collect();

        let drained =
            tokio::time::timeout(grace, futures::future::join_all(joins.iter_mut())).await;
        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Workers still busy after shutdown grace, aborting"
            );
        }
        for join in &joins {
            join.abort();
        }

        let mut lost = Vec::new();
        for handle in &handles {
            handle.set_health(WorkerHealth::Terminated);
            lost.extend(handle.drain_in_flight());
        }
        self.registry.write().clear();
        info!(aborted_tasks = lost.len(), "Worker pool stopped");
        lost
    }

    fn spawn_locked(
        &self,
        workers: &mut HashMap<WorkerId, Arc<WorkerHandle>>,
        lane: Lane,
    ) -> WorkerId {
        let slots = match lane {
            Lane::Io => self.shared.io_slots,
            Lane::Cpu => 1,
        };
        let handle = Arc::new(WorkerHandle::new(lane, slots, self.shutdown.child_token()));
        handle.beat();
        let id = handle.id;
        workers.insert(id, Arc::clone(&handle));

        let join = tokio::spawn(worker::run(
            Arc::clone(&self.shared),
            Arc::clone(&handle),
            Arc::clone(&self.registry),
            self.events.clone(),
        ));
        handle.attach(join);

        debug!(worker_id = %id, lane = %lane, slots, "Spawned worker");
        let _ = self.events.send(PoolEvent::Spawned {
            worker_id: id,
            lane,
        });
        id
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("live", &self.live_count())
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

fn live_count(workers: &HashMap<WorkerId, Arc<WorkerHandle>>) -> usize {
    workers.values().filter(|h| h.is_live()).count()
}
