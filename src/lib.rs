//! Shardlimit - Token Bucket Rate Limiting Service
//!
//! This crate implements a token bucket rate limiter with two interchangeable
//! engines: an in-process one, and a distributed one that runs each check as
//! an atomic script on the Redis shard owning the key. Keys are spread over
//! shards with a CRC32 consistent hash ring.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod shard;
pub mod storage;
