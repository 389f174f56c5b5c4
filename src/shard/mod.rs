//! Key-to-shard routing.
//!
//! Buckets are spread over independent storage shards by consistent
//! hashing. Every key is owned by exactly one shard; the ring is built once
//! at start-up and only read afterwards, so lookups need no locking.

mod picker;
mod ring;

pub use picker::ShardPicker;
pub use ring::{hash_key, HashRing, ShardNode, DEFAULT_REPLICAS, MAX_REPLICAS};
