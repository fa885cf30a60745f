//! Per-dependency circuit breakers.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[consecutive failures reach failure_threshold]--> Open
//! Open     --[recovery_timeout elapsed]-------------------------> HalfOpen
//! HalfOpen --[half_open_max_calls trials all succeed]-----------> Closed
//! HalfOpen --[any trial fails]----------------------------------> Open (timer reset)
//! ```
//!
//! While open, calls are rejected without invoking the wrapped function.
//! While half-open, at most `half_open_max_calls` trials are admitted; later
//! calls are rejected as if the circuit were open until the trials settle.
//!
//! # Thread Safety
//!
//! Each breaker serializes its transitions behind a `parking_lot::Mutex`. The
//! lock is never held across the wrapped call.

use crate::config::Config;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BreakerSettings {
    fn from(config: &Config) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerError<E> {
    /// Rejected without invoking the function.
    Open { name: String },
    /// The function ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { name } => write!(f, "circuit '{name}' is open"),
            BreakerError::Inner(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

/// A state change, broadcast to registry subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub half_open_trials: u32,
    pub transitions: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Monotonic time of the last transition; drives the recovery timer.
    changed_at: Instant,
    last_transition: DateTime<Utc>,
    /// Trials admitted in the current half-open window.
    half_open_admitted: u32,
    half_open_successes: u32,
    /// Bumped on every transition so late completions from an earlier state
    /// cannot affect the current one.
    generation: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            changed_at: Instant::now(),
            last_transition: Utc::now(),
            half_open_admitted: 0,
            half_open_successes: 0,
            generation: 0,
        }
    }
}

/// Admission granted to one call.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self::with_channel(name.into(), settings, transitions)
    }

    fn with_channel(
        name: String,
        settings: BreakerSettings,
        transitions: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(BreakerInner::new()),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker.
    ///
    /// A call that is dropped before it completes (e.g. by a timeout) counts
    /// as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().ok_or_else(|| BreakerError::Open {
            name: self.name.clone(),
        })?;
        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let outcome = f().await;
        guard.settle(outcome.is_ok());
        outcome.map_err(BreakerError::Inner)
    }

    /// Current state, applying the recovery timer.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.apply_recovery_timer(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.apply_recovery_timer(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
            half_open_trials: inner.half_open_admitted,
            transitions: inner.generation,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.apply_recovery_timer(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Admission {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open => {
                debug!(breaker = %self.name, "Circuit open, rejecting call");
                None
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted >= self.settings.half_open_max_calls {
                    debug!(breaker = %self.name, "Half-open trial budget spent, rejecting call");
                    return None;
                }
                inner.half_open_admitted += 1;
                Some(Admission {
                    generation: inner.generation,
                    trial: true,
                })
            }
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != admission.generation {
            return;
        }
        match (inner.state, success) {
            (CircuitState::Closed, true) => inner.consecutive_failures = 0,
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker OPENED"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) if admission.trial => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.half_open_max_calls {
                    inner.consecutive_failures = 0;
                    info!(breaker = %self.name, "Circuit breaker CLOSED after successful trials");
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) if admission.trial => {
                inner.consecutive_failures += 1;
                warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn apply_recovery_timer(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.changed_at.elapsed() >= self.settings.recovery_timeout
        {
            info!(breaker = %self.name, "Recovery timeout elapsed, circuit half-open");
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.changed_at = Instant::now();
        inner.last_transition = Utc::now();
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;
        inner.generation += 1;
        let _ = self.transitions.send(BreakerTransition {
            name: self.name.clone(),
            from,
            to,
            at: inner.last_transition,
        });
    }
}

/// Settles an admission exactly once, treating an abandoned call as failed.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        if !self.settled {
            self.settled = true;
            self.breaker.record(self.admission, success);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// One breaker per dependency name, created on first use and kept for the
/// life of the registry.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
            transitions,
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::with_channel(
                name.to_string(),
                self.settings,
                self.transitions.clone(),
            ))
        });
        Arc::clone(breaker)
    }

    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(name).call(f).await
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("settings", &self.settings)
            .field("breakers", &self.len())
            .finish()
    }
}
