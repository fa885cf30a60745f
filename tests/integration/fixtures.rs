//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Orchestrator configs with short intervals
//! - Common payloads (squares, sleeps, failures)
//! - Invocation counters and completion logs

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskhive::{Config, Orchestrator, TaskFailure, TaskPayload, TaskSpec};

/// Config with fast background loops so tests settle quickly.
pub fn fast_config() -> Config {
    Config {
        scale_interval_ms: 50,
        health_interval_ms: 50,
        heartbeat_interval_ms: 20,
        liveness_grace_ms: 2_000,
        metrics_interval_ms: 100,
        shutdown_grace_secs: 2.0,
        ..Default::default()
    }
}

/// Two workers, one per lane, that never scale.
pub fn fixed_pool_config() -> Config {
    Config {
        min_workers: 2,
        max_workers: 2,
        ..fast_config()
    }
}

pub async fn started(config: Config) -> Orchestrator {
    let orchestrator = Orchestrator::new(config).expect("valid config");
    orchestrator.start().await.expect("orchestrator starts");
    orchestrator
}

pub fn square(n: i64) -> TaskSpec {
    TaskSpec::new(TaskPayload::blocking(move || Ok(json!(n * n))))
}

/// Blocking payload that holds its CPU worker for `ms`.
pub fn cpu_sleep(ms: u64) -> TaskSpec {
    TaskSpec::new(TaskPayload::blocking(move || {
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!(ms))
    }))
}

/// Async payload that sleeps `ms` and returns it.
pub fn io_sleep(ms: u64) -> TaskSpec {
    TaskSpec::new(TaskPayload::future(move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    }))
}

/// Counts how many times payloads built from it were invoked.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Blocking payload that always fails.
    pub fn failing(&self, message: &'static str) -> TaskSpec {
        let calls = Arc::clone(&self.0);
        TaskSpec::new(TaskPayload::blocking(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskFailure::execution(message))
        }))
    }

    /// Blocking payload that fails until its `succeed_on`-th invocation.
    pub fn flaky(&self, succeed_on: usize) -> TaskSpec {
        let calls = Arc::clone(&self.0);
        TaskSpec::new(TaskPayload::blocking(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= succeed_on {
                Ok(json!(call))
            } else {
                Err(TaskFailure::execution(format!("attempt {call} failed")))
            }
        }))
    }

    /// Blocking payload that succeeds and counts.
    pub fn succeeding(&self) -> TaskSpec {
        let calls = Arc::clone(&self.0);
        TaskSpec::new(TaskPayload::blocking(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ok"))
        }))
    }
}

/// Shared log of labels in the order payloads ran.
#[derive(Debug, Clone, Default)]
pub struct RunLog(Arc<Mutex<Vec<&'static str>>>);

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    /// Blocking payload that appends `label` when it runs.
    pub fn recording(&self, label: &'static str) -> TaskSpec {
        let log = Arc::clone(&self.0);
        TaskSpec::new(TaskPayload::blocking(move || {
            log.lock().push(label);
            Ok(json!(label))
        }))
    }
}
