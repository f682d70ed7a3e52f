//! Retry with exponential backoff
//!
//! Shared by both provider decorators. Transient errors retry with
//! jittered exponential backoff, honoring any provider-supplied
//! retry-after hint; permanent errors surface immediately. Each retry
//! increments the shared error counters tagged by provider and kind.

use crate::cancel::CancellationToken;
use crate::client::{ErrorCounters, ProviderError, TokenBucket};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff configuration for one provider.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Fraction of the delay randomized away, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped - spread + rand::thread_rng().gen_range(0.0..=(2.0 * spread))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()))
    }
}

/// Run `op` under a token bucket and retry policy.
///
/// Each attempt first waits for a rate-limit token. Retryable failures
/// sleep the backoff (or the provider's retry-after hint, whichever is
/// longer) and try again; cancellation abandons pending retries.
pub async fn with_retries<T, F, Fut>(
    provider: &'static str,
    policy: &RetryPolicy,
    bucket: &TokenBucket,
    counters: &Arc<ErrorCounters>,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        bucket.acquire(cancel).await?;

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                counters.record(provider, err.kind());
                let mut delay = policy.backoff(attempt);
                if let ProviderError::RateLimited { retry_after: Some(hint) } = &err {
                    delay = delay.max(*hint);
                }
                tracing::debug!(
                    provider,
                    kind = err.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    // Budget exhausted on a transient error.
                    counters.record(provider, err.kind());
                }
                return Err(err);
            }
        }
    }
}
