//! Swappable per-task limiter.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{SpeedLimiter, TokenBucket};
use crate::request::SpeedLimit;

/// Limiter indirection handed to sources once and reconfigured behind their
/// back. Switching Unlimited → bounded installs a fresh bucket; changing a
/// bounded limit updates the existing bucket's rate in place, so in-flight
/// acquirers see the new rate on their next refill.
pub struct DelegatingLimiter {
    bucket: Mutex<Option<Arc<TokenBucket>>>,
}

impl DelegatingLimiter {
    pub fn new(limit: SpeedLimit) -> Self {
        let bucket = match limit {
            SpeedLimit::Unlimited => None,
            SpeedLimit::BytesPerSec { rate } => Some(Arc::new(TokenBucket::new(rate))),
        };
        Self { bucket: Mutex::new(bucket) }
    }

    pub fn set_limit(&self, limit: SpeedLimit) {
        let mut slot = self.bucket.lock().unwrap();
        match limit {
            SpeedLimit::Unlimited => *slot = None,
            SpeedLimit::BytesPerSec { rate } => match slot.as_ref() {
                Some(bucket) => bucket.update_rate(rate),
                None => *slot = Some(Arc::new(TokenBucket::new(rate))),
            },
        }
    }

    pub fn current_limit(&self) -> SpeedLimit {
        match self.bucket.lock().unwrap().as_ref() {
            Some(bucket) => SpeedLimit::BytesPerSec { rate: bucket.rate() },
            None => SpeedLimit::Unlimited,
        }
    }
}

#[async_trait]
impl SpeedLimiter for DelegatingLimiter {
    async fn acquire(&self, bytes: u64) {
        let bucket = self.bucket.lock().unwrap().clone();
        if let Some(bucket) = bucket {
            bucket.acquire(bytes).await;
        }
    }
}
