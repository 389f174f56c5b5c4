//! In-process atomic store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AtomicStore, ScriptArgs, StoreError, StoreValue};
use crate::ratelimit::{BucketState, TokenBucketConfig};

/// Shortest expiry applied to a bucket record.
const MIN_TTL_MS: i64 = 1000;

/// A store that runs the token bucket step under one mutex.
///
/// Behaves like a single Redis node running the Lua script: every call
/// for a key is serialized, records expire after `max(interval, 1s)` of
/// inactivity, and time comes from the caller. Expired records are
/// reclaimed on the next call that observes a later clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<RecordTable>,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    state: BucketState,
    expires_at_ms: i64,
}

/// Records plus an expiry index, soonest first.
#[derive(Debug, Default)]
struct RecordTable {
    entries: HashMap<String, Record>,
    expiries: BTreeSet<(i64, String)>,
}

impl RecordTable {
    /// Drop every record whose expiry is at or before `now_ms`.
    fn sweep(&mut self, now_ms: i64) {
        while let Some((expires_at_ms, _)) = self.expiries.first() {
            if *expires_at_ms > now_ms {
                break;
            }
            if let Some((_, key)) = self.expiries.pop_first() {
                self.entries.remove(&key);
            }
        }
    }

    fn insert(&mut self, key: &str, record: Record) {
        if let Some(old) = self.entries.insert(key.to_string(), record) {
            self.expiries.remove(&(old.expires_at_ms, key.to_string()));
        }
        self.expiries.insert((record.expires_at_ms, key.to_string()));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records. Records that expired since the last
    /// call are counted until that next call reclaims them.
    pub fn len(&self) -> usize {
        self.records.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored `(tokens, last_refill_ms)` for a key.
    pub fn record(&self, key: &str) -> Option<(f64, i64)> {
        self.records
            .lock()
            .entries
            .get(key)
            .map(|r| (r.state.tokens, r.state.last_refill_ms))
    }

    fn execute(&self, key: &str, args: &ScriptArgs) -> Vec<StoreValue> {
        let config = TokenBucketConfig {
            capacity: args.capacity,
            refill_rate: args.refill_rate,
            refill_interval: std::time::Duration::from_millis(args.interval_ms.max(0) as u64),
        };
        let now = args.now_ms;

        let mut records = self.records.lock();
        records.sweep(now);

        let mut state = match records.entries.get(key) {
            Some(record) => record.state,
            None => BucketState::full(&config, now),
        };

        let decision = state.admit(&config, now);

        records.insert(
            key,
            Record {
                state,
                expires_at_ms: now.saturating_add(args.interval_ms.max(MIN_TTL_MS)),
            },
        );

        vec![
            StoreValue::Integer(i64::from(decision.allowed)),
            StoreValue::Float(state.tokens),
            StoreValue::Integer(decision.retry_after_ms() as i64),
        ]
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn run_token_bucket(
        &self,
        key: &str,
        args: &ScriptArgs,
    ) -> Result<Vec<StoreValue>, StoreError> {
        Ok(self.execute(key, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(now_ms: i64) -> ScriptArgs {
        ScriptArgs {
            capacity: 2,
            refill_rate: 1,
            interval_ms: 10_000,
            now_ms,
        }
    }

    #[tokio::test]
    async fn test_absent_key_starts_full_and_admits() {
        let store = MemoryStore::new();
        let reply = store.run_token_bucket("k", &args(0)).await.unwrap();

        assert_eq!(reply[0], StoreValue::Integer(1));
        assert_eq!(reply[1], StoreValue::Float(1.0));
        assert_eq!(reply[2], StoreValue::Integer(0));
        assert_eq!(store.record("k"), Some((1.0, 0)));
    }

    #[tokio::test]
    async fn test_empty_bucket_reports_retry_delay() {
        let store = MemoryStore::new();
        store.run_token_bucket("k", &args(0)).await.unwrap();
        store.run_token_bucket("k", &args(0)).await.unwrap();
        let reply = store.run_token_bucket("k", &args(0)).await.unwrap();

        assert_eq!(reply[0], StoreValue::Integer(0));
        assert_eq!(reply[2], StoreValue::Integer(10_000));
    }

    #[tokio::test]
    async fn test_idle_record_expires() {
        let store = MemoryStore::new();
        store.run_token_bucket("k", &args(0)).await.unwrap();
        store.run_token_bucket("k", &args(0)).await.unwrap();

        // past the 10s expiry the record is treated as absent again
        let reply = store.run_token_bucket("k", &args(10_000)).await.unwrap();
        assert_eq!(reply[0], StoreValue::Integer(1));
        assert_eq!(store.record("k"), Some((1.0, 10_000)));
    }

    #[tokio::test]
    async fn test_expired_records_are_reclaimed() {
        let store = MemoryStore::new();
        let short = |now_ms| ScriptArgs {
            capacity: 5,
            refill_rate: 5,
            interval_ms: 1_000,
            now_ms,
        };

        for i in 0..1000 {
            store
                .run_token_bucket(&format!("idle-{i}"), &short(0))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1000);

        store
            .run_token_bucket("late", &short(10_000_000))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.record("idle-0").is_none());
        assert!(store.record("late").is_some());
    }

    #[tokio::test]
    async fn test_refreshed_record_survives_sweep() {
        let store = MemoryStore::new();
        store.run_token_bucket("busy", &args(0)).await.unwrap();
        store.run_token_bucket("idle", &args(0)).await.unwrap();

        // "busy" is refreshed to expire at 15s; "idle" still expires at 10s
        store.run_token_bucket("busy", &args(5_000)).await.unwrap();
        store.run_token_bucket("other", &args(12_000)).await.unwrap();

        assert!(store.record("busy").is_some());
        assert!(store.record("idle").is_none());
        assert_eq!(store.len(), 2);
    }
}
