//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod decision;
mod distributed;
mod limiter;

pub use backend::{Limiter, RateLimiterBackend};
pub use bucket::{
    retry_after_ms, BucketState, TokenBucketConfig, DEFAULT_CAPACITY, DEFAULT_REFILL_INTERVAL,
    DEFAULT_REFILL_RATE,
};
pub(crate) use bucket::floor_tokens;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use distributed::{DistributedRateLimiter, DEFAULT_KEY, KEY_PREFIX};
pub use limiter::RateLimiter;
