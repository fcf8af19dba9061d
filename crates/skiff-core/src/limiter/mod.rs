//! Download rate limiting.
//!
//! A token bucket paces bytes per task; a second bucket paces the whole
//! engine. Sources call one composed `throttle(bytes)` callback before each
//! write, which acquires from the task limiter then the global one — the
//! more restrictive dominates.

mod bucket;
mod delegate;

pub use bucket::TokenBucket;
pub use delegate::DelegatingLimiter;

use async_trait::async_trait;

/// Grants permission to move `bytes` over the wire. Implementations return
/// once enough budget has accumulated.
#[async_trait]
pub trait SpeedLimiter: Send + Sync {
    async fn acquire(&self, bytes: u64);
}

/// Limiter that never waits.
pub struct UnlimitedLimiter;

#[async_trait]
impl SpeedLimiter for UnlimitedLimiter {
    async fn acquire(&self, _bytes: u64) {}
}
