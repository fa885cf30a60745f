//! Backing store for the priority queue.
//!
//! [`QueueStore`] is the boundary to whatever actually holds waiting tasks.
//! The queue calls it under its own lock, so implementations need not be
//! internally synchronized.

use crate::core::task::{Lane, Priority, Task, TaskId};
use crate::Result;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Priority-ordered holding area for queued tasks.
///
/// `pop` must return the task with the highest priority and, among equal
/// priorities, the lowest `seq`.
pub trait QueueStore: Send {
    /// Prepare the store for use. An error here aborts orchestrator start.
    fn open(&mut self) -> Result<()>;

    fn push(&mut self, task: Task) -> Result<()>;

    fn pop(&mut self, lane: Lane) -> Result<Option<Task>>;

    fn remove(&mut self, id: &TaskId) -> Result<Option<Task>>;

    /// Remove and return every waiting task.
    fn drain(&mut self) -> Result<Vec<Task>>;

    fn len(&self) -> usize;

    fn len_lane(&self, lane: Lane) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort key: highest priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<Priority>,
    seq: u64,
}

impl OrderKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: Reverse(task.priority),
            seq: task.seq,
        }
    }
}

/// In-process store: one ordered map per lane plus an id index.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    io: BTreeMap<OrderKey, Task>,
    cpu: BTreeMap<OrderKey, Task>,
    index: HashMap<TaskId, (Lane, OrderKey)>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut BTreeMap<OrderKey, Task> {
        match lane {
            Lane::Io => &mut self.io,
            Lane::Cpu => &mut self.cpu,
        }
    }
}

impl QueueStore for MemoryQueueStore {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn push(&mut self, task: Task) -> Result<()> {
        let key = OrderKey::of(&task);
        let lane = task.lane;
        if let Some((old_lane, old_key)) = self.index.insert(task.id, (lane, key)) {
            self.lane_mut(old_lane).remove(&old_key);
        }
        self.lane_mut(lane).insert(key, task);
        Ok(())
    }

    fn pop(&mut self, lane: Lane) -> Result<Option<Task>> {
        let popped = self.lane_mut(lane).pop_first().map(|(_, task)| task);
        if let Some(task) = &popped {
            self.index.remove(&task.id);
        }
        Ok(popped)
    }

    fn remove(&mut self, id: &TaskId) -> Result<Option<Task>> {
        match self.index.remove(id) {
            Some((lane, key)) => Ok(self.lane_mut(lane).remove(&key)),
            None => Ok(None),
        }
    }

    fn drain(&mut self) -> Result<Vec<Task>> {
        self.index.clear();
        let mut drained: Vec<Task> = std::mem::take(&mut self.io).into_values().collect();
        drained.extend(std::mem::take(&mut self.cpu).into_values());
        Ok(drained)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn len_lane(&self, lane: Lane) -> usize {
        match lane {
            Lane::Io => self.io.len(),
            Lane::Cpu => self.cpu.len(),
        }
    }
}
