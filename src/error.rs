//! Error types for the Shardlimit service.

use thiserror::Error;

use crate::storage::StoreError;

/// Main error type for Shardlimit operations.
#[derive(Error, Debug)]
pub enum ShardlimitError {
    /// Invalid configuration or shard set. Only raised at start-up.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The atomic remote operation could not be executed.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The store answered with a reply the engine cannot interpret.
    #[error("Malformed storage response: {0}")]
    MalformedResponse(String),

    /// No shard could be resolved for a key.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The call was abandoned before the store answered; the bucket may or
    /// may not have been debited.
    #[error("Outcome unknown: {0}")]
    OutcomeUnknown(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for ShardlimitError {
    fn from(err: StoreError) -> Self {
        ShardlimitError::StorageUnavailable(err.to_string())
    }
}

impl From<::config::ConfigError> for ShardlimitError {
    fn from(err: ::config::ConfigError) -> Self {
        ShardlimitError::Config(err.to_string())
    }
}

/// Result type alias for Shardlimit operations.
pub type Result<T> = std::result::Result<T, ShardlimitError>;
