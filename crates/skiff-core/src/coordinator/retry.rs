//! Retry loop with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::DownloadError;

/// Exponential backoff policy: `base_delay * 2^attempt`, capped, with a
/// server-sent `Retry-After` overriding the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            ..Self::default()
        }
    }

    /// Delay before retrying `attempt` (0-based), or None to give up.
    pub fn next_delay(&self, attempt: u32, error: &DownloadError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.retry_count {
            return None;
        }
        if let DownloadError::Http { retry_after_secs: Some(secs), .. } = error {
            return Some(Duration::from_secs(*secs));
        }
        let exp = 1u32 << attempt.min(8);
        Some(self.base_delay.saturating_mul(exp).min(self.max_delay))
    }

    /// Runs `op` until success, a non-retryable error, exhausted attempts,
    /// or cancellation. Cancellation wins over any in-flight error,
    /// including during the backoff sleep.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(), DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DownloadError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Canceled),
                r = op() => r,
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if matches!(err, DownloadError::Canceled) {
                return Err(err);
            }
            match self.next_delay(attempt, &err) {
                None => return Err(err),
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
