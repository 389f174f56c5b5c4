//! Rate limiter trait for abstracting local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::distributed::DistributedRateLimiter;
use super::limiter::RateLimiter;
use crate::config::{BackendKind, ShardlimitConfig};
use crate::error::{Result, ShardlimitError};
use crate::shard::{ShardNode, ShardPicker};
use crate::storage::{self, StoreHandle};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the local `RateLimiter` and the
/// `DistributedRateLimiter` to allow the HTTP layer to work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check and charge the bucket for `key`.
    async fn allow(&self, key: &str) -> Result<Decision>;
}

/// The limiter selected by configuration.
#[derive(Debug)]
pub enum Limiter {
    InMemory(RateLimiter),
    Distributed(DistributedRateLimiter),
}

impl Limiter {
    /// Build the configured backend, connecting to every shard.
    pub async fn from_config(config: &ShardlimitConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build the configured backend on a specific clock.
    pub async fn from_config_with_clock(
        config: &ShardlimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let bucket = config.rate_limiting.token_bucket();

        match config.rate_limiting.backend {
            BackendKind::Memory => {
                let mut limiter = RateLimiter::with_clock(bucket, clock);
                if let Some(max_keys) = config.rate_limiting.max_keys {
                    limiter = limiter.with_max_keys(max_keys);
                }
                info!(
                    capacity = bucket.capacity,
                    refill_rate = bucket.refill_rate,
                    refill_interval = ?bucket.refill_interval,
                    max_keys = ?config.rate_limiting.max_keys,
                    "In-memory rate limiter initialized"
                );
                Ok(Limiter::InMemory(limiter))
            }
            BackendKind::Redis => {
                let redis = &config.redis;
                let mut nodes: Vec<ShardNode<StoreHandle>> =
                    Vec::with_capacity(redis.shards.len());

                for (index, shard) in redis.shards.iter().enumerate() {
                    let handle = storage::connect(&shard.url, redis.connect_timeout())
                        .await
                        .map_err(|e| {
                            ShardlimitError::Config(format!(
                                "failed to open shard {} ({}): {}",
                                index,
                                storage::display_addr(&shard.url),
                                e
                            ))
                        })?;
                    nodes.push(ShardNode::new(shard.ring_id(index), handle));
                }

                let picker = ShardPicker::from_nodes(nodes, redis.hash_replicas)?;
                let limiter = DistributedRateLimiter::new(picker, bucket)
                    .with_clock(clock)
                    .with_op_timeout(redis.op_timeout());

                info!(
                    shards = limiter.shard_count(),
                    hash_replicas = redis.hash_replicas,
                    op_timeout = ?redis.op_timeout(),
                    capacity = bucket.capacity,
                    refill_rate = bucket.refill_rate,
                    refill_interval = ?bucket.refill_interval,
                    "Distributed rate limiter initialized"
                );
                Ok(Limiter::Distributed(limiter))
            }
        }
    }
}

#[async_trait]
impl RateLimiterBackend for Limiter {
    async fn allow(&self, key: &str) -> Result<Decision> {
        match self {
            Limiter::InMemory(limiter) => limiter.allow(key).await,
            Limiter::Distributed(limiter) => limiter.allow(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;

    #[tokio::test]
    async fn test_default_config_builds_in_memory() {
        let limiter = Limiter::from_config(&ShardlimitConfig::default()).await.unwrap();
        assert!(matches!(limiter, Limiter::InMemory(_)));

        let decision = limiter.allow("key").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_memory_shards_build_distributed() {
        let mut config = ShardlimitConfig::default();
        config.rate_limiting.backend = BackendKind::Redis;
        config.redis.shards = (0..3)
            .map(|i| ShardConfig {
                url: format!("memory://shard-{i}"),
                id: None,
            })
            .collect();

        let limiter = Limiter::from_config(&config).await.unwrap();
        match &limiter {
            Limiter::Distributed(inner) => {
                assert_eq!(inner.shard_count(), 3);
                assert_eq!(inner.op_timeout(), Some(std::time::Duration::from_secs(1)));
            }
            other => panic!("expected distributed limiter, got {other:?}"),
        }

        assert!(limiter.allow("key").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_redis_backend_without_shards_fails() {
        let mut config = ShardlimitConfig::default();
        config.rate_limiting.backend = BackendKind::Redis;

        let err = Limiter::from_config(&config).await.unwrap_err();
        assert!(matches!(err, ShardlimitError::Config(_)));
    }
}
