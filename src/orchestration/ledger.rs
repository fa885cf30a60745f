//! Lifecycle tracking for submitted tasks.
//!
//! The ledger knows every task that has not been evicted: its current status,
//! lane, attempt count, and the cancellation token shared by all of its
//! attempts. Entries are evicted only once terminal, either when the result is
//! retrieved or when the retention window elapses.

use crate::core::task::{Lane, Task, TaskId, TaskStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct LedgerEntry {
    status: TaskStatus,
    lane: Lane,
    attempts: u32,
    cancel: CancellationToken,
    finished: Option<Instant>,
}

/// Read-only view of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerView {
    pub status: TaskStatus,
    pub lane: Lane,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub queued: usize,
    pub running: usize,
    pub terminal: usize,
}

#[derive(Debug, Default)]
pub struct TaskLedger {
    entries: RwLock<HashMap<TaskId, LedgerEntry>>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly submitted task as queued.
    pub fn register(&self, task: &Task) {
        self.entries.write().insert(
            task.id,
            LedgerEntry {
                status: TaskStatus::Queued,
                lane: task.lane,
                attempts: task.attempts,
                cancel: CancellationToken::new(),
                finished: None,
            },
        );
    }

    pub fn mark_running(&self, id: &TaskId, attempts: u32) {
        self.update(id, |entry| {
            entry.status = TaskStatus::Running;
            entry.attempts = attempts;
        });
    }

    /// Back to queued while a retry waits out its backoff.
    pub fn mark_queued(&self, id: &TaskId) {
        self.update(id, |entry| entry.status = TaskStatus::Queued);
    }

    /// Record a terminal status. Returns false if the task was already
    /// terminal or is unknown.
    pub fn mark_terminal(&self, id: &TaskId, status: TaskStatus, attempts: u32) -> bool {
        debug_assert!(status.is_terminal());
        let mut entries = self.entries.write();
        match entries.get_mut(id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.status = status;
                entry.attempts = attempts;
                entry.finished = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.entries.read().get(id).map(|entry| entry.status)
    }

    pub fn view(&self, id: &TaskId) -> Option<LedgerView> {
        self.entries.read().get(id).map(|entry| LedgerView {
            status: entry.status,
            lane: entry.lane,
            attempts: entry.attempts,
        })
    }

    /// Token cancelled when the caller cancels this task.
    pub fn cancel_token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.entries.read().get(id).map(|entry| entry.cancel.clone())
    }

    /// Drop a terminal entry. Queued and running entries are never evicted.
    pub fn evict(&self, id: &TaskId) -> bool {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(entry) if entry.status.is_terminal() => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Evict terminal entries that finished more than `retention` ago.
    pub fn sweep(&self, retention: Duration) -> Vec<TaskId> {
        let mut entries = self.entries.write();
        let expired: Vec<TaskId> = entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .finished
                    .is_some_and(|finished| finished.elapsed() >= retention)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "Ledger sweep");
        }
        expired
    }

    pub fn counts(&self) -> LedgerCounts {
        let entries = self.entries.read();
        let mut counts = LedgerCounts::default();
        for entry in entries.values() {
            match entry.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                _ => counts.terminal += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn update(&self, id: &TaskId, f: impl FnOnce(&mut LedgerEntry)) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            if !entry.status.is_terminal() {
                f(entry);
            }
        }
    }
}
