//! Continuous-refill token bucket.
//!
//! Tokens accrue fractionally with elapsed wall-clock time, so no background
//! task is needed to top buckets up. The same math runs in process for the
//! in-memory backend and inside the store for the distributed backend.

use std::time::Duration;

use super::decision::Decision;

/// Default bucket capacity (burst size).
pub const DEFAULT_CAPACITY: u64 = 100;
/// Default number of tokens granted per refill interval.
pub const DEFAULT_REFILL_RATE: u64 = 50;
/// Default refill interval.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(60);

/// Parameters shared by every bucket of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    /// Maximum tokens a bucket can hold
    pub capacity: u64,
    /// Tokens granted per `refill_interval`
    pub refill_rate: u64,
    /// Window over which `refill_rate` tokens accrue
    pub refill_interval: Duration,
}

impl TokenBucketConfig {
    /// Create a configuration, replacing zero values with the defaults.
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self {
            capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            refill_rate: if refill_rate == 0 {
                DEFAULT_REFILL_RATE
            } else {
                refill_rate
            },
            refill_interval: if refill_interval.is_zero() {
                DEFAULT_REFILL_INTERVAL
            } else {
                refill_interval
            },
        }
    }

    /// Refill interval in milliseconds. Sub-millisecond intervals are
    /// rounded up to one second so the math never divides by zero.
    pub fn refill_interval_ms(&self) -> i64 {
        match i64::try_from(self.refill_interval.as_millis()) {
            Ok(0) => 1000,
            Ok(ms) => ms,
            Err(_) => i64::MAX,
        }
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_REFILL_RATE, DEFAULT_REFILL_INTERVAL)
    }
}

/// Mutable state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Current tokens, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Milliseconds since the epoch of the last refill
    pub last_refill_ms: i64,
}

impl BucketState {
    /// State for a key seen for the first time. The first request is
    /// admitted straight away, so the bucket starts one token down.
    pub fn fresh(config: &TokenBucketConfig, now_ms: i64) -> (Self, Decision) {
        let state = Self {
            tokens: config.capacity.saturating_sub(1) as f64,
            last_refill_ms: now_ms,
        };
        (state, Decision::allow(state.remaining(config)))
    }

    /// A full bucket that has not been charged yet.
    pub fn full(config: &TokenBucketConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Grant tokens for the time elapsed since the last refill.
    ///
    /// A clock that moved backwards grants nothing and leaves
    /// `last_refill_ms` where it was.
    pub fn refill(&mut self, config: &TokenBucketConfig, now_ms: i64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed <= 0 {
            return;
        }

        let granted = config.refill_rate as f64 * elapsed as f64
            / config.refill_interval_ms() as f64;
        if granted > 0.0 {
            self.tokens = (self.tokens + granted).min(config.capacity as f64);
        }
        self.last_refill_ms = now_ms;
    }

    /// Take one token if available.
    pub fn consume(&mut self, config: &TokenBucketConfig) -> Decision {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Decision::allow(self.remaining(config));
        }

        let wait_ms = retry_after_ms(
            self.tokens,
            config.refill_rate,
            config.refill_interval_ms(),
        );
        Decision::deny(self.remaining(config), Duration::from_millis(wait_ms))
    }

    /// Refill then consume.
    pub fn admit(&mut self, config: &TokenBucketConfig, now_ms: i64) -> Decision {
        self.refill(config, now_ms);
        self.consume(config)
    }

    /// Whole tokens left, clamped to `[0, capacity]`.
    pub fn remaining(&self, config: &TokenBucketConfig) -> u64 {
        floor_tokens(self.tokens, config.capacity)
    }
}

/// Milliseconds until `tokens` reaches one, rounded up.
///
/// Falls back to a whole interval when nothing is ever refilled.
pub fn retry_after_ms(tokens: f64, refill_rate: u64, interval_ms: i64) -> u64 {
    if refill_rate == 0 {
        return u64::try_from(interval_ms).unwrap_or(0);
    }

    let missing = (1.0 - tokens).max(0.0);
    let wait = (missing * interval_ms as f64 / refill_rate as f64).ceil();
    if wait.is_finite() && wait > 0.0 {
        wait as u64
    } else {
        0
    }
}

/// Floor a token count into `[0, capacity]`.
pub(crate) fn floor_tokens(tokens: f64, capacity: u64) -> u64 {
    if !tokens.is_finite() || tokens <= 0.0 {
        return 0;
    }
    (tokens.floor() as u64).min(capacity)
}
