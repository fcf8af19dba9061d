//! Token bucket with continuous wall-clock refill and live rate updates.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::SpeedLimiter;

/// Token bucket: holds up to `burst` tokens, refilled continuously at
/// `rate` bytes per second. `acquire(n)` drains `n` tokens, sleeping while
/// the bucket catches up; a request larger than the burst drains in
/// burst-sized bites, so its effective rate is capped at `rate` and it
/// stalls for roughly `(n - burst) / rate` seconds.
pub struct TokenBucket {
    inner: Mutex<Bucket>,
}

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

fn default_burst(rate: u64) -> f64 {
    (rate / 5).max(1) as f64
}

impl TokenBucket {
    /// Bucket with `burst = max(rate / 5, 1)`, starting full.
    pub fn new(rate: u64) -> Self {
        Self::with_burst(rate, (rate / 5).max(1))
    }

    pub fn with_burst(rate: u64, burst: u64) -> Self {
        let rate = rate.max(1) as f64;
        let burst = burst.max(1) as f64;
        Self {
            inner: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Change the rate live. In-flight acquirers observe the new rate on
    /// their next refill; accumulated tokens are clamped to the new burst.
    pub fn update_rate(&self, rate: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.refill(Instant::now());
        inner.rate = rate.max(1) as f64;
        inner.burst = default_burst(rate);
        inner.tokens = inner.tokens.min(inner.burst);
    }

    pub fn rate(&self) -> u64 {
        self.inner.lock().unwrap().rate as u64
    }
}

#[async_trait]
impl SpeedLimiter for TokenBucket {
    async fn acquire(&self, bytes: u64) {
        let mut need = bytes as f64;
        loop {
            let wait = {
                let mut inner = self.inner.lock().unwrap();
                inner.refill(Instant::now());
                let take = need.min(inner.tokens);
                inner.tokens -= take;
                need -= take;
                if need <= 0.0 {
                    return;
                }
                // Sleep until the next bite fits; a bite is at most one burst.
                let bite = need.min(inner.burst);
                Duration::from_secs_f64((bite - inner.tokens).max(0.0) / inner.rate)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_granted_immediately() {
        let bucket = TokenBucket::new(1000); // burst 200, starts full
        let start = Instant::now();
        bucket.acquire(200).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_acquire_stalls_at_rate() {
        let bucket = TokenBucket::new(1000); // burst 200
        let start = Instant::now();
        bucket.acquire(500).await;
        // (500 - 200) / 1000 = 0.3 s, within sleep granularity.
        let secs = start.elapsed().as_secs_f64();
        assert!((0.28..=0.40).contains(&secs), "stalled {:.3}s", secs);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_throughput_matches_rate() {
        let bucket = TokenBucket::new(10_000);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire(5_000).await;
        }
        // 50_000 bytes minus the initial burst at 10_000 B/s.
        let secs = start.elapsed().as_secs_f64();
        assert!((4.5..=5.5).contains(&secs), "took {:.3}s", secs);
    }

    #[tokio::test(start_paused = true)]
    async fn update_rate_takes_effect() {
        let bucket = TokenBucket::new(100);
        bucket.acquire(20).await; // drain the burst
        bucket.update_rate(10_000);
        assert_eq!(bucket.rate(), 10_000);

        let start = Instant::now();
        bucket.acquire(5_000).await;
        // At the old rate this would take ~50 s; at the new one ~0.5 s.
        assert!(start.elapsed().as_secs_f64() < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_burst_is_one_byte() {
        let bucket = TokenBucket::new(2);
        let start = Instant::now();
        bucket.acquire(3).await;
        // burst 1, so 2 more bytes at 2 B/s ≈ 1 s.
        assert!(start.elapsed().as_secs_f64() >= 0.9);
    }
}
