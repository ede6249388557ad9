//! Token-bucket rate limiter shared by every worker, with an adaptive
//! congestion penalty.
//!
//! Refill is computed lazily on each `acquire()` from the elapsed time, so no
//! background timer is needed. A congestion signal from any worker raises a
//! penalty delay that every later `acquire()` waits out; runs of successes
//! decay it again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{seconds, EngineConfig};

/// Penalties below this are treated as no penalty at all.
const PENALTY_FLOOR: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    penalty: Duration,
    success_streak: u32,
}

impl RateBucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<RateBucket>,
    rate: f64,
    capacity: f64,
    initial_penalty: Duration,
    max_penalty: Duration,
    decay_window: u32,
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(RateBucket {
                tokens: capacity,
                last_refill: Instant::now(),
                penalty: Duration::ZERO,
                success_streak: 0,
            }),
            rate: requests_per_second,
            capacity,
            initial_penalty: Duration::from_millis(250),
            max_penalty: Duration::from_secs(5),
            decay_window: 10,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.requests_per_second, config.burst).with_penalty(
            Duration::from_millis(config.congestion_penalty_ms),
            Duration::from_millis(config.max_congestion_penalty_ms),
            config.penalty_decay_window,
        )
    }

    pub fn with_penalty(mut self, initial: Duration, max: Duration, decay_window: u32) -> Self {
        self.initial_penalty = initial;
        self.max_penalty = max;
        self.decay_window = decay_window.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RateBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the caller may issue one remote call. Only the calling
    /// task sleeps.
    pub async fn acquire(&self) {
        let penalty = self.lock().penalty;
        if !penalty.is_zero() {
            debug!(penalty_ms = penalty.as_millis() as u64, "Waiting out congestion penalty");
            sleep(penalty).await;
        }

        loop {
            let wait = {
                let mut bucket = self.lock();
                bucket.refill(Instant::now(), self.rate, self.capacity);
                // Tolerate float drift from the computed wait below.
                if bucket.tokens >= 1.0 - 1e-9 {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                    return;
                }
                seconds((1.0 - bucket.tokens) / self.rate)
            };
            sleep(wait).await;
        }
    }

    /// Records a congestion signal (e.g. HTTP 429). Raises the shared
    /// penalty and empties the bucket so no worker bursts into the overload.
    pub fn notify_congestion(&self, retry_after: Option<Duration>) {
        let mut bucket = self.lock();
        let escalated = (bucket.penalty * 2)
            .max(self.initial_penalty)
            .max(retry_after.unwrap_or_default())
            .min(self.max_penalty);
        bucket.penalty = escalated;
        bucket.success_streak = 0;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
        warn!(penalty_ms = escalated.as_millis() as u64, "Remote signalled congestion; throttling all workers");
    }

    /// Records a successful call; enough consecutive ones decay the penalty.
    pub fn notify_success(&self) {
        let mut bucket = self.lock();
        if bucket.penalty.is_zero() {
            return;
        }
        bucket.success_streak += 1;
        if bucket.success_streak >= self.decay_window {
            bucket.success_streak = 0;
            let halved = bucket.penalty / 2;
            bucket.penalty = if halved < PENALTY_FLOOR { Duration::ZERO } else { halved };
            if bucket.penalty.is_zero() {
                info!("Congestion penalty cleared");
            } else {
                debug!(penalty_ms = bucket.penalty.as_millis() as u64, "Congestion penalty decayed");
            }
        }
    }
}
