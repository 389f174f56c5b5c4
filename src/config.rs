//! Configuration management for Shardlimit.
//!
//! Settings come from an optional YAML file overlaid with environment
//! variables prefixed `SHARDLIMIT__`, using `__` between nested keys
//! (`SHARDLIMIT__RATE_LIMITING__BACKEND=redis`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ShardlimitError};
use crate::ratelimit::TokenBucketConfig;
use crate::shard::{DEFAULT_REPLICAS, MAX_REPLICAS};
use crate::storage::{display_addr, MEMORY_SCHEME};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SHARDLIMIT";
/// Legacy override for the listen port.
pub const HTTP_PORT_ENV: &str = "HTTP_PORT";

/// Main configuration for the Shardlimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardlimitConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Redis shard configuration
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Which limiter backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Rate limiting configuration.
///
/// Non-positive bucket values fall back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Maximum tokens per bucket
    #[serde(default)]
    pub bucket_capacity: i64,

    /// Tokens granted per refill interval
    #[serde(default)]
    pub refill_rate: i64,

    /// Refill interval in milliseconds
    #[serde(default)]
    pub refill_interval_ms: i64,

    /// Upper bound on in-memory buckets; unbounded when unset
    #[serde(default)]
    pub max_keys: Option<usize>,
}

impl RateLimitingConfig {
    /// Bucket parameters with defaults applied.
    pub fn token_bucket(&self) -> TokenBucketConfig {
        let positive = |v: i64| u64::try_from(v).unwrap_or(0);
        TokenBucketConfig::new(
            positive(self.bucket_capacity),
            positive(self.refill_rate),
            Duration::from_millis(positive(self.refill_interval_ms)),
        )
    }
}

/// One storage shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// `redis://[user:pass@]host:port[/db]`, `rediss://...` or `memory://name`
    pub url: String,

    /// Ring identifier; defaults to `redis-{index}-{host}`
    #[serde(default)]
    pub id: Option<String>,
}

impl ShardConfig {
    /// The identifier used to place this shard on the hash ring.
    pub fn ring_id(&self, index: usize) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("redis-{}-{}", index, display_addr(&self.url)),
        }
    }
}

/// Redis shard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Virtual ring positions per shard
    #[serde(default = "default_hash_replicas")]
    pub hash_replicas: usize,

    /// Connect and ping timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-call deadline for the token bucket script; an expired call
    /// reports an unknown outcome
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            hash_replicas: default_hash_replicas(),
            connect_timeout_ms: default_connect_timeout_ms(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

fn default_hash_replicas() -> usize {
    DEFAULT_REPLICAS
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_op_timeout_ms() -> u64 {
    1000
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl ShardlimitConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: ShardlimitConfig = settings.try_deserialize()?;
        config.apply_port_override(std::env::var(HTTP_PORT_ENV).ok().as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ShardlimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ShardlimitError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the listen port, keeping the host.
    pub fn apply_port_override(&mut self, port: Option<&str>) -> Result<()> {
        let Some(port) = port.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let port: u16 = port
            .parse()
            .map_err(|_| ShardlimitError::Config(format!("invalid {HTTP_PORT_ENV}: {port}")))?;
        self.server.http_addr.set_port(port);
        Ok(())
    }

    /// Check settings that can only be wrong at start-up.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.backend != BackendKind::Redis {
            return Ok(());
        }

        if self.redis.shards.is_empty() {
            return Err(ShardlimitError::Config(
                "redis backend selected but no shards configured".to_string(),
            ));
        }

        if self.redis.hash_replicas > MAX_REPLICAS {
            return Err(ShardlimitError::Config(format!(
                "hash_replicas {} exceeds the limit of {}",
                self.redis.hash_replicas, MAX_REPLICAS
            )));
        }

        if self.redis.op_timeout_ms == 0 {
            return Err(ShardlimitError::Config(
                "op_timeout_ms must be greater than zero".to_string(),
            ));
        }

        for (index, shard) in self.redis.shards.iter().enumerate() {
            let supported = ["redis://", "rediss://", MEMORY_SCHEME]
                .iter()
                .any(|scheme| shard.url.starts_with(scheme));
            if !supported {
                return Err(ShardlimitError::Config(format!(
                    "shard {} has unsupported url {:?}",
                    index, shard.url
                )));
            }
        }

        Ok(())
    }
}
