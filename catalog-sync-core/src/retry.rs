//! # retry: per-operation retry and backoff controller
//!
//! Each operation walks `Pending → Attempting → {Succeeded, Retrying, Failed}`
//! with `Retrying → Attempting` looping until the retry budget is spent.
//! The decision for one outcome is pure data ([`RetryPolicy::decide`]); the
//! [`RetryController`] only drives the loop: token, call, decide, sleep.
//!
//! Rate-limit and transient retries share one budget, so an operation never
//! sees more than `max_retries + 1` attempts.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{seconds, EngineConfig};
use crate::contract::{Operation, RemoteCall, RemoteOutcome, RemoteStatus};
use crate::rate_limit::RateLimiter;
use crate::result::{ItemOutcome, ItemResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What to do after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Succeeded,
    Retrying(Duration),
    Failed,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: seconds(config.base_delay_seconds),
            backoff_factor: config.backoff_factor,
            max_delay: seconds(config.max_delay_seconds),
        }
    }

    /// `base_delay * backoff_factor^retry`, capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        seconds(secs)
    }

    /// Decides the next state given the outcome and the number of retries
    /// already performed for this operation.
    pub fn decide(&self, outcome: &RemoteOutcome, retries_so_far: u32) -> Decision {
        match outcome.status {
            RemoteStatus::Success => Decision::Succeeded,
            RemoteStatus::PermanentFailure => Decision::Failed,
            RemoteStatus::RateLimited | RemoteStatus::TransientFailure => {
                if retries_so_far >= self.max_retries {
                    return Decision::Failed;
                }
                let backoff = self.backoff(retries_so_far);
                let delay = outcome
                    .retry_after
                    .map_or(backoff, |after| after.max(backoff))
                    .min(self.max_delay);
                Decision::Retrying(delay)
            }
        }
    }
}

/// Drives one operation to a terminal [`ItemResult`].
pub struct RetryController<'a> {
    pub policy: &'a RetryPolicy,
    pub limiter: &'a RateLimiter,
    pub call_timeout: Duration,
    pub dry_run: bool,
    pub cancel: &'a CancellationToken,
}

impl RetryController<'_> {
    pub async fn execute(&self, session: &dyn RemoteCall, op: Operation) -> ItemResult {
        if self.dry_run {
            let now = Utc::now();
            let outcome = RemoteOutcome::success().with_message("dry run");
            return ItemResult::attempted(ItemOutcome::Succeeded, op, 0, now, now, outcome);
        }

        let first_attempt = Utc::now();
        let mut attempts = 0u32;
        loop {
            self.limiter.acquire().await;
            attempts += 1;
            let started = Instant::now();
            let outcome = match timeout(self.call_timeout, session.call(&op)).await {
                Ok(mut outcome) => {
                    if outcome.latency.is_zero() {
                        outcome.latency = started.elapsed();
                    }
                    outcome
                }
                Err(_) => RemoteOutcome::transient(format!(
                    "call timed out after {}ms",
                    self.call_timeout.as_millis()
                ))
                .with_latency(started.elapsed()),
            };
            let last_attempt = Utc::now();

            if outcome.is_success() {
                self.limiter.notify_success();
            } else if outcome.status == RemoteStatus::RateLimited {
                self.limiter.notify_congestion(outcome.retry_after);
            }

            let retries = attempts - 1;
            match self.policy.decide(&outcome, retries) {
                Decision::Succeeded => {
                    return ItemResult::attempted(
                        ItemOutcome::Succeeded,
                        op,
                        attempts,
                        first_attempt,
                        last_attempt,
                        outcome,
                    );
                }
                Decision::Failed => {
                    warn!(
                        key = %op.key,
                        attempts,
                        status = ?outcome.status,
                        code = ?outcome.status_code,
                        message = outcome.message.as_deref().unwrap_or(""),
                        "Operation failed"
                    );
                    return ItemResult::attempted(
                        ItemOutcome::Failed,
                        op,
                        attempts,
                        first_attempt,
                        last_attempt,
                        outcome,
                    );
                }
                Decision::Retrying(delay) => {
                    debug!(
                        key = %op.key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        status = ?outcome.status,
                        "Retrying operation after backoff"
                    );
                    let cancelled = tokio::select! {
                        _ = sleep(delay) => self.cancel.is_cancelled(),
                        _ = self.cancel.cancelled() => true,
                    };
                    if cancelled {
                        return ItemResult::attempted(
                            ItemOutcome::Failed,
                            op,
                            attempts,
                            first_attempt,
                            last_attempt,
                            outcome,
                        )
                        .with_reason("run cancelled before retry")
                        .interrupted();
                    }
                }
            }
        }
    }
}
