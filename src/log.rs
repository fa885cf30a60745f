//! Structured logging for taskhive.
//!
//! All components emit `tracing` events with structured fields. This module
//! only installs a subscriber for hosts that do not bring their own.
//!
//! Log levels:
//! - ERROR: Orchestrator lifecycle failures
//! - WARN: Unresponsive workers, breaker trips, forced shutdowns
//! - INFO: Startup, shutdown, scale decisions, breaker transitions
//! - DEBUG: Task dispatch, retries, queue activity
//! - TRACE: Heartbeats and per-sample autoscaler metrics
//!
//! Debug mode can be enabled with `init_with_debug(true)` or `TASKHIVE_DEBUG=1`.
//! `RUST_LOG`, when set, overrides both.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that turns on debug-level output.
pub const DEBUG_ENV_VAR: &str = "TASKHIVE_DEBUG";

/// Initialize logging at INFO level (DEBUG when `TASKHIVE_DEBUG` is set).
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "taskhive=debug,info"
    } else {
        "info"
    }
}
