//! Redis-backed shard.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Script, Value};
use tracing::{debug, info};

use super::{AtomicStore, ScriptArgs, StoreError, StoreValue};

/// Token bucket step executed server side.
///
/// KEYS[1] is the bucket hash; ARGV is capacity, refill rate, interval in
/// milliseconds and the caller's clock in milliseconds. Replies with
/// `{allowed, tokens, retry_after_ms}`.
pub const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local interval_ms = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])

local data = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])

if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now_ms
else
  local elapsed = now_ms - last_refill
  if elapsed > 0 and interval_ms > 0 then
    local refill = (refill_rate * elapsed) / interval_ms
    if refill > 0 then
      tokens = math.min(capacity, tokens + refill)
    end
    last_refill = now_ms
  end
end

local allowed = 0
local retry_after = 0

if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
elseif refill_rate > 0 then
  retry_after = math.ceil(((1 - tokens) * interval_ms) / refill_rate)
else
  retry_after = interval_ms
end

redis.call("HSET", key, "tokens", tostring(tokens), "last_refill", last_refill)
redis.call("PEXPIRE", key, math.max(interval_ms, 1000))

return {allowed, tostring(tokens), retry_after}
"#;

/// The script is compiled (hashed) once per process and shared by every
/// shard.
fn token_bucket_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(TOKEN_BUCKET_LUA))
}

/// A single Redis node holding a disjoint subset of buckets.
#[derive(Clone)]
pub struct RedisShard {
    addr: String,
    conn: MultiplexedConnection,
}

impl RedisShard {
    /// Open a multiplexed connection and verify it with `PING`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let addr = display_addr(url);

        let connect = async {
            let mut conn = client.get_multiplexed_tokio_connection().await?;
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok::<_, StoreError>(conn)
        };

        let conn = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| StoreError::ConnectTimeout {
                addr: addr.clone(),
                timeout,
            })??;

        info!(addr = %addr, "Connected to redis shard");

        Ok(Self { addr, conn })
    }

    /// Wrap an already established connection.
    pub fn from_connection(addr: impl Into<String>, conn: MultiplexedConnection) -> Self {
        Self {
            addr: addr.into(),
            conn,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl std::fmt::Debug for RedisShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisShard")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AtomicStore for RedisShard {
    async fn run_token_bucket(
        &self,
        key: &str,
        args: &ScriptArgs,
    ) -> Result<Vec<StoreValue>, StoreError> {
        let mut conn = self.conn.clone();

        let mut invocation = token_bucket_script().prepare_invoke();
        invocation
            .key(key)
            .arg(args.capacity)
            .arg(args.refill_rate)
            .arg(args.interval_ms)
            .arg(args.now_ms);

        let reply: Value = invocation.invoke_async(&mut conn).await?;

        debug!(addr = %self.addr, key = %key, reply = ?reply, "Token bucket script replied");

        Ok(reply_cells(reply))
    }
}

/// Host part of a shard URL, without scheme or credentials.
pub fn display_addr(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.split('/').next().unwrap_or(rest).to_string()
}

/// Flatten a script reply into cells. A non-array reply becomes a single
/// cell so the caller reports the shape mismatch.
fn reply_cells(reply: Value) -> Vec<StoreValue> {
    match reply {
        Value::Bulk(items) => items.into_iter().map(to_store_value).collect(),
        other => vec![to_store_value(other)],
    }
}

fn to_store_value(value: Value) -> StoreValue {
    match value {
        Value::Int(v) => StoreValue::Integer(v),
        Value::Data(bytes) => StoreValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Status(s) => StoreValue::Text(s),
        Value::Okay => StoreValue::Text("OK".to_string()),
        Value::Nil | Value::Bulk(_) => StoreValue::Nil,
    }
}
