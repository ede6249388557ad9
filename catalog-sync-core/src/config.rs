use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Run-level engine settings. Every field has a default so config files only
/// need to name what they change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub workers: usize,
    pub requests_per_second: f64,
    /// Token bucket capacity. 1 means strict pacing with no bursts.
    pub burst: u32,
    pub max_retries: u32,
    pub base_delay_seconds: f64,
    pub backoff_factor: f64,
    pub max_delay_seconds: f64,
    pub per_call_timeout_seconds: f64,
    pub dry_run: bool,
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_interval_seconds: f64,
    /// Bounded hand-off queue between the reader and the workers.
    /// Defaults to four slots per worker.
    pub queue_capacity: Option<usize>,
    /// Wall-clock budget for the whole run; cancels cooperatively when spent.
    pub run_timeout_seconds: Option<f64>,
    pub congestion_penalty_ms: u64,
    pub max_congestion_penalty_ms: u64,
    /// Consecutive successes needed to halve the congestion penalty.
    pub penalty_decay_window: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requests_per_second: 10.0,
            burst: 1,
            max_retries: 3,
            base_delay_seconds: 1.0,
            backoff_factor: 2.0,
            max_delay_seconds: 60.0,
            per_call_timeout_seconds: 30.0,
            dry_run: false,
            checkpoint_path: None,
            checkpoint_interval_seconds: 5.0,
            queue_capacity: None,
            run_timeout_seconds: None,
            congestion_penalty_ms: 250,
            max_congestion_penalty_ms: 5_000,
            penalty_decay_window: 10,
        }
    }
}

/// Slowest accepted pacing: one call every 1000 seconds.
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;
/// Upper bound for delays, timeouts and the checkpoint interval.
pub const MAX_INTERVAL_SECONDS: f64 = 86_400.0;
pub const MAX_RUN_TIMEOUT_SECONDS: f64 = 31_536_000.0;

/// Converts seconds to a `Duration` without panicking. Overflow saturates
/// and negative or NaN input becomes zero.
pub fn seconds(value: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(d) => d,
        Err(_) if value > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

fn at_most(field: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be at most {max}, got {value}")))
    }
}

fn positive_finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a positive number, got {value}")))
    }
}

fn non_negative_finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be zero or positive, got {value}")))
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        positive_finite("requests_per_second", self.requests_per_second)?;
        if self.requests_per_second < MIN_REQUESTS_PER_SECOND {
            return Err(ConfigError::invalid(
                "requests_per_second",
                format!("must be at least {MIN_REQUESTS_PER_SECOND}, got {}", self.requests_per_second),
            ));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("burst", "must be at least 1"));
        }
        non_negative_finite("base_delay_seconds", self.base_delay_seconds)?;
        at_most("base_delay_seconds", self.base_delay_seconds, MAX_INTERVAL_SECONDS)?;
        non_negative_finite("max_delay_seconds", self.max_delay_seconds)?;
        at_most("max_delay_seconds", self.max_delay_seconds, MAX_INTERVAL_SECONDS)?;
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(ConfigError::invalid(
                "backoff_factor",
                format!("must be at least 1.0, got {}", self.backoff_factor),
            ));
        }
        positive_finite("per_call_timeout_seconds", self.per_call_timeout_seconds)?;
        at_most("per_call_timeout_seconds", self.per_call_timeout_seconds, MAX_INTERVAL_SECONDS)?;
        positive_finite("checkpoint_interval_seconds", self.checkpoint_interval_seconds)?;
        at_most(
            "checkpoint_interval_seconds",
            self.checkpoint_interval_seconds,
            MAX_INTERVAL_SECONDS,
        )?;
        if let Some(t) = self.run_timeout_seconds {
            positive_finite("run_timeout_seconds", t)?;
            at_most("run_timeout_seconds", t, MAX_RUN_TIMEOUT_SECONDS)?;
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if self.congestion_penalty_ms > self.max_congestion_penalty_ms {
            return Err(ConfigError::invalid(
                "congestion_penalty_ms",
                "must not exceed max_congestion_penalty_ms",
            ));
        }
        if self.penalty_decay_window == 0 {
            return Err(ConfigError::invalid("penalty_decay_window", "must be at least 1"));
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.workers * 4)
    }

    pub fn per_call_timeout(&self) -> Duration {
        seconds(self.per_call_timeout_seconds)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        seconds(self.checkpoint_interval_seconds)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_seconds.map(seconds)
    }

    pub fn trace_loaded(&self) {
        info!(
            workers = self.workers,
            requests_per_second = self.requests_per_second,
            max_retries = self.max_retries,
            dry_run = self.dry_run,
            checkpoint = ?self.checkpoint_path,
            "Loaded EngineConfig"
        );
        debug!(?self, "EngineConfig loaded (full debug)");
    }
}
