//! In-process token bucket limiter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketState, TokenBucketConfig};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use crate::error::Result;

/// Token bucket limiter keeping every bucket in local memory.
///
/// A single mutex covers the whole read-modify-write of a bucket, so two
/// calls for the same key never interleave. The lock is never held across
/// an await point.
pub struct RateLimiter {
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<BucketTable>,
}

/// Bucket map plus an access-order index used for LRU eviction.
#[derive(Debug, Default)]
struct BucketTable {
    entries: HashMap<String, Slot>,
    /// access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    max_keys: Option<usize>,
}

#[derive(Debug)]
struct Slot {
    state: BucketState,
    tick: u64,
}

impl BucketTable {
    fn touch(&mut self, key: &str) -> Option<&mut BucketState> {
        let tick = self.next_tick;
        let slot = self.entries.get_mut(key)?;
        self.next_tick += 1;
        self.order.remove(&slot.tick);
        self.order.insert(tick, key.to_string());
        slot.tick = tick;
        Some(&mut slot.state)
    }

    fn insert(&mut self, key: &str, state: BucketState) {
        if let Some(max) = self.max_keys {
            while self.entries.len() >= max {
                let Some((_, oldest)) = self.order.pop_first() else {
                    break;
                };
                self.entries.remove(&oldest);
                debug!(key = %oldest, "Evicted least recently used bucket");
            }
        }

        self.order.insert(self.next_tick, key.to_string());
        self.entries.insert(
            key.to_string(),
            Slot {
                state,
                tick: self.next_tick,
            },
        );
        self.next_tick += 1;
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl RateLimiter {
    /// Create an unbounded limiter on the system clock.
    pub fn new(config: TokenBucketConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an unbounded limiter reading time from `clock`.
    pub fn with_clock(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: Mutex::new(BucketTable::default()),
        }
    }

    /// Bound the number of tracked keys. Once full, admitting a new key
    /// evicts the least recently used one, which then starts over as a
    /// fresh bucket if it comes back.
    pub fn with_max_keys(self, max_keys: usize) -> Self {
        {
            let mut table = self.buckets.lock();
            table.max_keys = Some(max_keys.max(1));
        }
        self
    }

    /// The bucket parameters of this limiter.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Check and charge the bucket for `key`.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();

        trace!(key = %key, now_ms = now, "Checking rate limit");

        let mut table = self.buckets.lock();

        let decision = match table.touch(key) {
            Some(state) => state.admit(&self.config, now),
            None => {
                let (state, decision) = BucketState::fresh(&self.config, now);
                debug!(
                    key = %key,
                    capacity = self.config.capacity,
                    "Creating new token bucket"
                );
                table.insert(key, state);
                decision
            }
        };

        if !decision.allowed {
            debug!(
                key = %key,
                retry_after_ms = decision.retry_after_ms(),
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Current token count for `key`, without refilling or charging.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let table = self.buckets.lock();
        table.entries.get(key).map(|slot| slot.state.tokens)
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.buckets.lock().entries.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn allow(&self, key: &str) -> Result<Decision> {
        Ok(self.check(key))
    }
}
