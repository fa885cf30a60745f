//! Lane-aware priority task queue.
//!
//! Wraps a [`QueueStore`] with a lock, FIFO sequence numbers, per-lane wakeups
//! and a closed flag. Taking a task off the queue and marking it running in the
//! ledger happen under the same lock, so a concurrent cancel either removes the
//! task while it is still queued or finds it running, never in between.

pub mod store;

pub use store::{MemoryQueueStore, QueueStore};

use crate::core::task::{Lane, Task, TaskId};
use crate::orchestration::ledger::TaskLedger;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PriorityTaskQueue {
    store: Mutex<Box<dyn QueueStore>>,
    ledger: Arc<TaskLedger>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    io_ready: Notify,
    cpu_ready: Notify,
}

impl PriorityTaskQueue {
    pub fn new(store: Box<dyn QueueStore>, ledger: Arc<TaskLedger>) -> Self {
        Self {
            store: Mutex::new(store),
            ledger,
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            io_ready: Notify::new(),
            cpu_ready: Notify::new(),
        }
    }

    pub fn in_memory(ledger: Arc<TaskLedger>) -> Self {
        Self::new(Box::new(MemoryQueueStore::new()), ledger)
    }

    /// Open the backing store.
    pub fn open(&self) -> Result<()> {
        self.store.lock().open()?;
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Add a task, assigning it the next FIFO sequence number.
    ///
    /// Fails with [`Error::QueueClosed`] once [`close`](Self::close) has been
    /// called.
    pub fn enqueue(&self, mut task: Task) -> Result<()> {
        let lane = task.lane;
        {
            let mut store = self.store.lock();
            if self.is_closed() {
                return Err(Error::QueueClosed);
            }
            task.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            store.push(task)?;
        }
        self.ready(lane).notify_one();
        Ok(())
    }

    /// Enqueue a batch under one lock so their relative order is preserved.
    pub fn enqueue_all(&self, tasks: Vec<Task>) -> Result<()> {
        let mut lanes = [false; 2];
        {
            let mut store = self.store.lock();
            if self.is_closed() {
                return Err(Error::QueueClosed);
            }
            for mut task in tasks {
                lanes[lane_index(task.lane)] = true;
                task.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                store.push(task)?;
            }
        }
        for lane in Lane::ALL {
            if lanes[lane_index(lane)] {
                self.ready(lane).notify_one();
            }
        }
        Ok(())
    }

    /// Take the next task for `lane`, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed or `shutdown` fires. The task
    /// comes back with its attempt counter already advanced and is marked
    /// running in the ledger.
    pub async fn dequeue(&self, lane: Lane, shutdown: &CancellationToken) -> Result<Option<Task>> {
        loop {
            let notified = self.ready(lane).notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() || shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(task) = self.try_dequeue(lane)? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return Ok(None),
            }
        }
    }

    /// Non-blocking variant of [`dequeue`](Self::dequeue).
    pub fn try_dequeue(&self, lane: Lane) -> Result<Option<Task>> {
        let mut store = self.store.lock();
        let Some(mut task) = store.pop(lane)? else {
            return Ok(None);
        };
        let attempt = task.begin_attempt();
        self.ledger.mark_running(&task.id, attempt);
        let more = store.len_lane(lane) > 0;
        drop(store);
        if more {
            // Pass the wakeup on so a sibling waiter picks up the next task.
            self.ready(lane).notify_one();
        }
        Ok(Some(task))
    }

    /// Pull a still-queued task out by id.
    pub fn remove(&self, id: &TaskId) -> Result<Option<Task>> {
        self.store.lock().remove(id)
    }

    /// Stop accepting tasks and wake every waiter.
    pub fn close(&self) {
        {
            let _store = self.store.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        debug!("Task queue closed");
        self.io_ready.notify_waiters();
        self.cpu_ready.notify_waiters();
    }

    /// Remove every waiting task, typically after [`close`](Self::close).
    pub fn drain(&self) -> Result<Vec<Task>> {
        self.store.lock().drain()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peek_depth(&self) -> usize {
        self.store.lock().len()
    }

    pub fn lane_depth(&self, lane: Lane) -> usize {
        self.store.lock().len_lane(lane)
    }

    fn ready(&self, lane: Lane) -> &Notify {
        match lane {
            Lane::Io => &self.io_ready,
            Lane::Cpu => &self.cpu_ready,
        }
    }
}

impl std::fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityTaskQueue")
            .field("depth", &self.peek_depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lane_index(lane: Lane) -> usize {
    match lane {
        Lane::Io => 0,
        Lane::Cpu => 1,
    }
}
