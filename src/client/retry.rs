//! Retry policy and backoff
//!
//! The backoff base is six times the upstream's documented minimum poll
//! interval, a deliberately large cushion so that retries never trip the
//! marketplace's rate limits. The cap is four times the base. Delay grows
//! linearly with the attempt number, plus up to 10% uniform jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::client::error::ClientResult;

/// Upstream's documented minimum poll interval.
pub const MIN_POLL_INTERVAL_SECS: u64 = 60;
/// Backoff base: minimum poll interval plus a 500% cushion.
pub const BACKOFF_BASE_SECS: u64 = MIN_POLL_INTERVAL_SECS * 6;
/// Backoff ceiling.
pub const BACKOFF_CAP_SECS: u64 = BACKOFF_BASE_SECS * 4;
/// Total attempts per call, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

/// Linear backoff policy with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base: Duration::from_secs(BACKOFF_BASE_SECS),
            cap: Duration::from_secs(BACKOFF_CAP_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `min(cap, base * attempt)` plus a
    /// uniform random jitter up to 10% of the capped delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(attempt.max(1));
        let capped = scaled.min(self.cap);
        let jitter = rand::thread_rng().gen_range(0.0..=capped.as_secs_f64() * 0.1);
        capped + Duration::from_secs_f64(jitter)
    }
}

/// Drive a fallible marketplace call through the retry policy.
///
/// Retries only errors classified as retryable, honoring a server-provided
/// `Retry-After` hint over the computed backoff. After exhausting attempts
/// the last classified error surfaces unchanged.
pub async fn fetch_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = err.retry_after().unwrap_or_else(|| policy.delay(attempt));
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    status = err.status(),
                    delay_secs = delay.as_secs_f64(),
                    "marketplace call failed, retrying: {err}"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
