//! Token-bucket admission control shared by all workers of a run.
//!
//! # Overview
//!
//! The bucket refills continuously at `rate` tokens per second and holds at
//! most `rate` tokens (a one-second burst budget). Every request attempt
//! takes one token. When fewer than one token is available the caller
//! computes the exact time until one token accrues, sleeps for it and then
//! takes that token.
//!
//! The bucket state sits behind a `tokio::sync::Mutex` that is held across
//! the wait, so concurrent callers queue up behind each other and the
//! steady-state throughput can never exceed `rate` requests per second.
//! Waiting on the mutex or the sleep is an await point; other workers keep
//! running.
//!
//! The bucket starts with a single token rather than a full one, so the
//! very first second of a run obeys the ceiling as well.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bulkfetch_core::transfer::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(20.0));
//!
//! let worker_limiter = Arc::clone(&limiter);
//! tokio::spawn(async move {
//!     worker_limiter.acquire().await;
//!     // ... issue the request
//! });
//! # }
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Token-bucket rate limiter.
///
/// `RateLimiter` is `Send + Sync` and designed to be wrapped in `Arc` and
/// shared across spawned Tokio tasks.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second; also the bucket capacity. `None` disables limiting.
    rate: Option<f64>,

    /// Bucket state, mutated under mutual exclusion on every acquisition.
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter admitting at most `rate` acquisitions per second.
    ///
    /// A non-positive or non-finite rate yields a disabled limiter.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(rate: f64) -> Self {
        if !(rate.is_finite() && rate > 0.0) {
            return Self::disabled();
        }
        debug!("creating token bucket rate limiter");
        Self {
            rate: Some(rate),
            bucket: Mutex::new(Bucket {
                tokens: 1.0_f64.min(rate),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a disabled rate limiter that admits every caller immediately.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            rate: None,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.rate.is_none()
    }

    /// Returns the configured rate in requests per second.
    #[must_use]
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Waits until a token is available, then consumes it.
    pub async fn acquire(&self) {
        let Some(rate) = self.rate else {
            return;
        };

        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return;
        }

        let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / rate);
        trace!(wait_ms = wait.as_millis(), "waiting for rate token");
        tokio::time::sleep(wait).await;

        // The token that accrued during the sleep is the one consumed here.
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }
}
