//! Process-wide configuration for the orchestrator.
//!
//! Every field has a serde default, so a partial `taskhive.toml` is valid and
//! a missing file simply yields [`Config::default`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_MIN_WORKERS: usize = 2;
pub const DEFAULT_MAX_WORKERS: usize = 16;
pub const DEFAULT_SCALE_UP_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SCALE_DOWN_THRESHOLD: f64 = 0.3;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 100;
pub const DEFAULT_TASK_TIMEOUT_SECS: f64 = 600.0;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Workers added or removed per autoscaler decision.
    pub scale_step: usize,
    /// Upper bound on tasks running at once across every worker.
    pub max_concurrent_tasks: usize,
    /// Concurrent tasks multiplexed on a single I/O-lane worker.
    pub io_slots_per_worker: usize,
    /// Timeout applied to tasks submitted without one.
    pub task_timeout_secs: f64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub half_open_max_calls: u32,
    pub scale_interval_ms: u64,
    pub health_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A worker silent for longer than this is declared unresponsive.
    pub liveness_grace_ms: u64,
    pub shutdown_grace_secs: f64,
    pub result_retention_secs: u64,
    pub metrics_interval_ms: u64,
    /// Capacity of the completion broadcast feeding gathers and streams.
    pub stream_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            scale_up_threshold: DEFAULT_SCALE_UP_THRESHOLD,
            scale_down_threshold: DEFAULT_SCALE_DOWN_THRESHOLD,
            scale_step: 2,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            io_slots_per_worker: 8,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_secs: DEFAULT_RECOVERY_TIMEOUT_SECS,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            scale_interval_ms: 1_000,
            health_interval_ms: 1_000,
            heartbeat_interval_ms: 250,
            liveness_grace_ms: 5_000,
            shutdown_grace_secs: 10.0,
            result_retention_secs: 3_600,
            metrics_interval_ms: 5_000,
            stream_buffer: 1_024,
        }
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskhive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("taskhive.toml"))
    }

    /// Load from `~/.taskhive/taskhive.toml`, or defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_workers < 2 {
            return Err(Error::Config(format!(
                "min_workers must be at least 2 (one per lane), got {}",
                self.min_workers
            )));
        }
        if self.max_workers < self.min_workers {
            return Err(Error::Config(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.scale_up_threshold) || !in_unit(self.scale_down_threshold) {
            return Err(Error::Config(
                "scale thresholds must lie within [0, 1]".to_string(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(Error::Config(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.scale_step == 0 {
            return Err(Error::Config("scale_step must be >= 1".to_string()));
        }
        if self.max_concurrent_tasks == 0 || self.io_slots_per_worker == 0 {
            return Err(Error::Config(
                "max_concurrent_tasks and io_slots_per_worker must be >= 1".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(Error::Config("stream_buffer must be >= 1".to_string()));
        }
        if self.failure_threshold == 0 || self.half_open_max_calls == 0 {
            return Err(Error::Config(
                "failure_threshold and half_open_max_calls must be >= 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("task_timeout_secs", self.task_timeout_secs),
            ("recovery_timeout_secs", self.recovery_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(Error::Config(format!("{name} must be positive")));
            }
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(Error::Config(format!("{name} is too large ({secs})")));
            }
        }
        if !(self.shutdown_grace_secs.is_finite() && self.shutdown_grace_secs >= 0.0) {
            return Err(Error::Config(
                "shutdown_grace_secs must not be negative".to_string(),
            ));
        }
        if Duration::try_from_secs_f64(self.shutdown_grace_secs).is_err() {
            return Err(Error::Config(format!(
                "shutdown_grace_secs is too large ({})",
                self.shutdown_grace_secs
            )));
        }
        for (name, ms) in [
            ("scale_interval_ms", self.scale_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
        ] {
            if ms == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.liveness_grace_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(
                "liveness_grace_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        seconds(self.task_timeout_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        seconds(self.recovery_timeout_secs)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_millis(self.liveness_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Seconds as a `Duration`, saturating where `from_secs_f64` would panic.
fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
