//! Admission decision returned by every limiter backend.

use std::time::Duration;

/// The verdict for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Whole tokens left in the bucket after this decision.
    pub remaining: u64,
    /// Minimum wait until a token is available. Zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    /// An admitting decision.
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    /// A denying decision.
    pub fn deny(remaining: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
        }
    }

    /// Retry delay in whole milliseconds.
    pub fn retry_after_ms(&self) -> u64 {
        u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX)
    }
}
