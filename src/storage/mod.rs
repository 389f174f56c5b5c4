//! Storage shards able to run the token bucket atomically.
//!
//! The distributed limiter needs exactly one capability from a shard: run
//! the refill-and-consume step for one key as a single indivisible
//! operation and hand back `(allowed, tokens, retry_after_ms)`.

mod memory;
mod redis_shard;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_shard::{display_addr, RedisShard, TOKEN_BUCKET_LUA};

/// URL scheme selecting the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Errors raised by a storage shard.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("unsupported shard url: {0}")]
    UnsupportedUrl(String),
}

/// Arguments of one token bucket invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptArgs {
    pub capacity: u64,
    pub refill_rate: u64,
    pub interval_ms: i64,
    /// Caller-supplied time; the store never reads its own clock.
    pub now_ms: i64,
}

/// One cell of a store reply.
///
/// Stores encode numbers differently depending on protocol and value, so
/// each cell keeps the representation it arrived in until it is parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Nil,
}

impl StoreValue {
    /// Parse the cell as an integer. Floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoreValue::Integer(v) => Some(*v),
            StoreValue::Float(v) if v.is_finite() => Some(*v as i64),
            StoreValue::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(|v| v as i64)
                })
            }
            _ => None,
        }
    }

    /// Parse the cell as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StoreValue::Integer(v) => Some(*v as f64),
            StoreValue::Float(v) => Some(*v),
            StoreValue::Text(s) => s.trim().parse::<f64>().ok(),
            StoreValue::Nil => None,
        }
    }
}

/// A shard that can run the token bucket step atomically for one key.
#[async_trait]
pub trait AtomicStore: Send + Sync + std::fmt::Debug {
    /// Run the refill-and-consume step against `key` and return the raw
    /// reply cells.
    async fn run_token_bucket(
        &self,
        key: &str,
        args: &ScriptArgs,
    ) -> Result<Vec<StoreValue>, StoreError>;
}

/// Shared handle to a shard.
pub type StoreHandle = Arc<dyn AtomicStore>;

/// Open a shard from its URL.
///
/// `redis://` and `rediss://` URLs open a Redis connection; `memory://`
/// opens a private in-process store, which only makes sense for a single
/// service instance.
pub async fn connect(url: &str, timeout: Duration) -> Result<StoreHandle, StoreError> {
    if url.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let shard = RedisShard::connect(url, timeout).await?;
        return Ok(Arc::new(shard));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_cells_parse_both_ways() {
        let cell = StoreValue::Integer(7);
        assert_eq!(cell.as_i64(), Some(7));
        assert_eq!(cell.as_f64(), Some(7.0));
    }

    #[test]
    fn test_float_cells_truncate_to_integer() {
        let cell = StoreValue::Float(3.75);
        assert_eq!(cell.as_i64(), Some(3));
        assert_eq!(cell.as_f64(), Some(3.75));
    }

    #[test]
    fn test_text_cells_parse() {
        assert_eq!(StoreValue::Text("12000".into()).as_i64(), Some(12_000));
        assert_eq!(StoreValue::Text("2.5".into()).as_f64(), Some(2.5));
        assert_eq!(StoreValue::Text("1.0".into()).as_i64(), Some(1));
    }

    #[test]
    fn test_unparseable_cells() {
        assert_eq!(StoreValue::Text("lots".into()).as_i64(), None);
        assert_eq!(StoreValue::Text("lots".into()).as_f64(), None);
        assert_eq!(StoreValue::Nil.as_i64(), None);
        assert_eq!(StoreValue::Float(f64::NAN).as_i64(), None);
    }

    #[tokio::test]
    async fn test_connect_memory_scheme() {
        let store = connect("memory://local", Duration::from_secs(1)).await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("http://localhost:6379", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedUrl(_)));
    }
}
