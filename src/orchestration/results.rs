//! Result aggregation and streaming.
//!
//! Every terminal [`TaskResult`] is recorded exactly once and pushed to a
//! broadcast channel. Gathers and streams subscribe *before* scanning stored
//! results, so a completion can never fall between the scan and the wait.

use crate::core::result::TaskResult;
use crate::core::task::TaskId;
use futures::Stream;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredResult {
    result: TaskResult,
    stored_at: Instant,
}

pub struct ResultAggregator {
    results: RwLock<HashMap<TaskId, StoredResult>>,
    completions: broadcast::Sender<TaskResult>,
}

impl ResultAggregator {
    pub fn new(buffer: usize) -> Self {
        let (completions, _) = broadcast::channel(buffer.max(1));
        Self {
            results: RwLock::new(HashMap::new()),
            completions,
        }
    }

    /// Store a terminal result and notify subscribers.
    ///
    /// Returns false, storing nothing, if a result for the task already exists.
    pub fn record(&self, result: TaskResult) -> bool {
        debug_assert!(result.is_terminal());
        {
            let mut results = self.results.write();
            if results.contains_key(&result.task_id) {
                warn!(task_id = %result.task_id, "Duplicate result ignored");
                return false;
            }
            results.insert(
                result.task_id,
                StoredResult {
                    result: result.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        debug!(task_id = %result.task_id, status = %result.status, "Result recorded");
        // No receivers is fine: nobody is waiting.
        let _ = self.completions.send(result);
        true
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskResult> {
        self.results.read().get(id).map(|stored| stored.result.clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.results.read().contains_key(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskResult> {
        self.completions.subscribe()
    }

    /// Wait for a result for every id, in `ids` order.
    ///
    /// On timeout, ids still unfinished are filled in by `pending`.
    pub async fn gather<F>(
        &self,
        ids: &[TaskId],
        timeout: Option<Duration>,
        pending: F,
    ) -> Vec<TaskResult>
    where
        F: Fn(&TaskId) -> TaskResult,
    {
        let mut rx = self.subscribe();
        let mut found: HashMap<TaskId, TaskResult> = HashMap::new();
        let mut remaining: HashSet<TaskId> = HashSet::new();
        for id in ids {
            match self.get(id) {
                Some(result) => {
                    found.insert(*id, result);
                }
                None => {
                    remaining.insert(*id);
                }
            }
        }

        let wait = async {
            while !remaining.is_empty() {
                match rx.recv().await {
                    Ok(result) => {
                        if remaining.remove(&result.task_id) {
                            found.insert(result.task_id, result);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Gather lagged, rescanning results");
                        remaining.retain(|id| match self.get(id) {
                            Some(result) => {
                                found.insert(*id, result);
                                false
                            }
                            None => true,
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    debug!(
                        unfinished = remaining.len(),
                        "Gather timed out, returning partial results"
                    );
                }
            }
            None => wait.await,
        }

        ids.iter()
            .map(|id| found.get(id).cloned().unwrap_or_else(|| pending(id)))
            .collect()
    }

    /// Lazily yield results for `ids` in completion order.
    ///
    /// Results already recorded come first, ordered by finish time. The stream
    /// ends once every id has been yielded; dropping it early is harmless.
    pub fn stream(self: &Arc<Self>, ids: &[TaskId]) -> impl Stream<Item = TaskResult> + Send + 'static {
        let rx = self.subscribe();
        let mut remaining: HashSet<TaskId> = ids.iter().copied().collect();
        let mut ready: Vec<TaskResult> = Vec::new();
        remaining.retain(|id| match self.get(id) {
            Some(result) => {
                ready.push(result);
                false
            }
            None => true,
        });
        ready.sort_by_key(|result| result.finished_at);

        let state = StreamState {
            aggregator: Arc::clone(self),
            rx,
            remaining,
            ready: ready.into(),
        };
        futures::stream::unfold(state, |mut state| async move {
            let next = state.next().await?;
            Some((next, state))
        })
    }

    /// Drop results stored longer than `retention` ago.
    pub fn sweep(&self, retention: Duration) -> usize {
        let mut results = self.results.write();
        let before = results.len();
        results.retain(|_, stored| stored.stored_at.elapsed() < retention);
        before - results.len()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("stored", &self.len())
            .field("subscribers", &self.completions.receiver_count())
            .finish()
    }
}

struct StreamState {
    aggregator: Arc<ResultAggregator>,
    rx: broadcast::Receiver<TaskResult>,
    remaining: HashSet<TaskId>,
    ready: VecDeque<TaskResult>,
}

impl StreamState {
    async fn next(&mut self) -> Option<TaskResult> {
        loop {
            if let Some(result) = self.ready.pop_front() {
                return Some(result);
            }
            if self.remaining.is_empty() {
                return None;
            }
            match self.rx.recv().await {
                Ok(result) => {
                    if self.remaining.remove(&result.task_id) {
                        return Some(result);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Result stream lagged, rescanning results");
                    let aggregator = Arc::clone(&self.aggregator);
                    let mut caught_up = Vec::new();
                    self.remaining.retain(|id| match aggregator.get(id) {
                        Some(result) => {
                            caught_up.push(result);
                            false
                        }
                        None => true,
                    });
                    caught_up.sort_by_key(|result| result.finished_at);
                    self.ready.extend(caught_up);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
