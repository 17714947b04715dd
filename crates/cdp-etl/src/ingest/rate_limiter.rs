//! Token-bucket rate limiting for outbound source calls
//!
//! Tokens refill lazily from the time elapsed since the last refill, capped at
//! the bucket capacity. There is no background timer. Waiters hold the bucket
//! lock while they sleep, so callers are served in arrival order.

use crate::error::{EtlError, EtlResult};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket with `capacity` burst size, refilled at `refill_rate` tokens per second.
    /// Starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> EtlResult<Self> {
        if capacity == 0 {
            return Err(EtlError::Config("rate limiter capacity must be at least 1".to_string()));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(EtlError::Config(format!(
                "rate limiter refill rate must be positive, got {}",
                refill_rate
            )));
        }

        Ok(Self {
            capacity: f64::from(capacity),
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    /// `calls` per minute with a burst of the same size
    pub fn per_minute(calls: u32) -> EtlResult<Self> {
        Self::new(calls, f64::from(calls) / 60.0)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn check_request(&self, n: u32) -> EtlResult<f64> {
        let wanted = f64::from(n);
        if wanted > self.capacity {
            return Err(EtlError::RateLimit(format!(
                "requested {} tokens but bucket capacity is {}",
                n, self.capacity
            )));
        }
        Ok(wanted)
    }

    /// Wait until `n` tokens are available, then take them.
    ///
    /// Fails immediately when `n` exceeds the capacity.
    pub async fn acquire(&self, n: u32) -> EtlResult<()> {
        let wanted = self.check_request(n)?;
        let mut state = self.state.lock().await;

        loop {
            state.refill(self.capacity, self.refill_rate);
            if state.tokens >= wanted {
                state.tokens -= wanted;
                return Ok(());
            }

            let deficit = wanted - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_rate);
            debug!(tokens = n, wait_ms = wait.as_millis() as u64, "Rate limited, waiting for tokens");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take `n` tokens if they are available right now.
    ///
    /// Returns `false` without waiting when tokens are short, when another
    /// caller is currently waiting, or when `n` exceeds the capacity.
    pub fn try_acquire(&self, n: u32) -> bool {
        let Ok(wanted) = self.check_request(n) else {
            return false;
        };
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };

        state.refill(self.capacity, self.refill_rate);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Tokens available now, after refill
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_rate);
        state.tokens
    }
}
