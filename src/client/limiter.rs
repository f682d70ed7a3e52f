//! Token-bucket rate limiter
//!
//! One bucket per provider, shared by every caller of that provider.
//! The mutex guards only the constant-time token-count update; waiting
//! happens outside it in timed sleeps so callers suspend cooperatively.

use crate::cancel::CancellationToken;
use crate::client::ProviderError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with configurable capacity and refill rate.
///
/// `acquire` waits up to `max_wait` for a token; on timeout it fails with
/// `RateLimited` without consuming anything.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, max_wait: Duration) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_wait,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket refilling at `per_minute / 60` tokens per second.
    pub fn per_minute(per_minute: f64, max_wait: Duration) -> Self {
        let per_sec = per_minute / 60.0;
        Self::new(per_minute.max(1.0), per_sec, max_wait)
    }

    /// Bucket refilling at `per_second` tokens per second.
    pub fn per_second(per_second: f64, max_wait: Duration) -> Self {
        Self::new(per_second.max(1.0), per_second, max_wait)
    }

    /// Take a token if one is available, otherwise return how long to
    /// wait before one will be.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait for a token, polling cancellation between sleeps.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    if started.elapsed() + wait > self.max_wait {
                        return Err(ProviderError::RateLimited { retry_after: Some(wait) });
                    }
                    // Sleep in short slices so cancellation is observed promptly.
                    tokio::time::sleep(wait.min(Duration::from_millis(50))).await;
                }
            }
        }
    }
}
