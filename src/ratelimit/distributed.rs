//! Distributed rate limiter backed by sharded atomic stores.
//!
//! Every check runs the whole refill-and-consume step as one script on the
//! shard that owns the key, so concurrent callers in different processes
//! are serialized by the store and can never both spend the last token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::{floor_tokens, TokenBucketConfig};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use crate::error::{Result, ShardlimitError};
use crate::shard::ShardPicker;
use crate::storage::{ScriptArgs, StoreHandle, StoreValue};

/// Namespace prepended to every bucket key in the store.
pub const KEY_PREFIX: &str = "rate_limiter";
/// Key used when the caller supplies an empty one.
pub const DEFAULT_KEY: &str = "default";

/// A token bucket limiter whose state lives in remote shards.
pub struct DistributedRateLimiter {
    picker: ShardPicker<StoreHandle>,
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    op_timeout: Option<Duration>,
}

impl DistributedRateLimiter {
    /// Create a distributed limiter on the system clock.
    pub fn new(picker: ShardPicker<StoreHandle>, config: TokenBucketConfig) -> Self {
        Self {
            picker,
            config,
            clock: Arc::new(SystemClock),
            op_timeout: None,
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Abandon store calls that take longer than `timeout`.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// The bucket parameters of this limiter.
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Deadline applied to each store call, if any.
    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout
    }

    /// Number of shards behind this limiter.
    pub fn shard_count(&self) -> usize {
        self.picker.shard_count()
    }

    /// Storage key for a logical key.
    pub fn bucket_key(key: &str) -> String {
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        format!("{KEY_PREFIX}:{key}")
    }

    /// Check and charge the bucket for `key`.
    ///
    /// Store failures are returned as-is; nothing is retried, because a
    /// retry after an ambiguous failure could charge the bucket twice.
    pub async fn check(&self, key: &str) -> Result<Decision> {
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        let shard = self.picker.pick(key)?;
        let storage_key = Self::bucket_key(key);

        let args = ScriptArgs {
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            interval_ms: self.config.refill_interval_ms(),
            now_ms: self.clock.now_millis(),
        };

        trace!(
            key = %key,
            shard = %shard.id,
            now_ms = args.now_ms,
            "Checking distributed rate limit"
        );

        let call = shard.handle.run_token_bucket(&storage_key, &args);
        let reply = match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                warn!(key = %key, shard = %shard.id, timeout = ?limit, "Store call timed out");
                ShardlimitError::OutcomeUnknown(format!(
                    "shard {} did not answer within {:?}",
                    shard.id, limit
                ))
            })?,
            None => call.await,
        };

        let cells = reply.map_err(|e| {
            warn!(key = %key, shard = %shard.id, error = %e, "Store call failed");
            ShardlimitError::from(e)
        })?;

        let decision = parse_reply(&cells, self.config.capacity)?;

        if !decision.allowed {
            debug!(
                key = %key,
                shard = %shard.id,
                retry_after_ms = decision.retry_after_ms(),
                "Distributed rate limit exceeded"
            );
        }

        Ok(decision)
    }
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("config", &self.config)
            .field("shards", &self.picker.shard_count())
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

/// Turn `(allowed, tokens, retry_after_ms)` into a decision.
fn parse_reply(cells: &[StoreValue], capacity: u64) -> Result<Decision> {
    let [allowed, tokens, retry_after] = cells else {
        return Err(ShardlimitError::MalformedResponse(format!(
            "expected 3 values, got {}: {:?}",
            cells.len(),
            cells
        )));
    };

    let allowed = allowed.as_i64().ok_or_else(|| malformed("allowed", allowed))?;
    let tokens = tokens.as_f64().ok_or_else(|| malformed("tokens", tokens))?;
    let retry_after = retry_after
        .as_i64()
        .ok_or_else(|| malformed("retry_after", retry_after))?;

    let remaining = floor_tokens(tokens, capacity);
    if allowed == 1 {
        Ok(Decision::allow(remaining))
    } else {
        let wait = Duration::from_millis(u64::try_from(retry_after).unwrap_or(0));
        Ok(Decision::deny(remaining, wait))
    }
}

fn malformed(field: &str, value: &StoreValue) -> ShardlimitError {
    ShardlimitError::MalformedResponse(format!("cannot parse {field} from {value:?}"))
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn allow(&self, key: &str) -> Result<Decision> {
        self.check(key).await
    }
}
