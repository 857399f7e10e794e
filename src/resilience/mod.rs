//! Resilience combinators for calls to unreliable collaborators.
//!
//! Each primitive is standalone; none of them depends on the runtime.

pub mod batch;
pub mod breaker;
pub mod cache;
pub mod dedup;
pub mod rate_limit;
pub mod retry;

pub use batch::{BatchOptions, Batcher};
pub use breaker::{BreakerError, BreakerOptions, BreakerState, CircuitBreaker};
pub use cache::{CacheEntry, CacheOptions, NETWORK_CACHE_KEY, ResponseCache};
pub use dedup::{Deduplicator, RequestKey};
pub use rate_limit::RateLimiter;
pub use retry::{RetryOptions, retry};
