//! Retry timing: exponential backoff for transient failures and the
//! long fixed pause for remote rate limiting.
//!
//! # Overview
//!
//! Two failure classes are retried, on two different clocks:
//!
//! - Overload (503) and transient errors back off exponentially,
//!   `min(base * multiplier^(attempt-1), max) + jitter`, and each one
//!   consumes an attempt from `max_attempts`.
//! - Rate limiting (429) pauses for a long fixed duration plus jitter.
//!   These pauses do not consume attempts, but are bounded by
//!   `max_rate_limit_pauses` so a permanently blocked item cannot stall
//!   its concurrency slot forever.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bulkfetch_core::transfer::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.should_retry(1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(attempt, 2);
//!         assert!(delay >= Duration::from_secs(1));
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::constants::MAX_RETRY_AFTER;

/// Default maximum attempts per item (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum backoff delay cap (60 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default maximum jitter added to backoff delays (2 seconds).
const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(2);

/// Default pause after a rate-limit response (30 seconds).
const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(30);

/// Default maximum jitter added to rate-limit pauses (5 seconds).
const DEFAULT_RATE_LIMIT_JITTER: Duration = Duration::from_secs(5);

/// Default bound on rate-limit pauses per item.
pub const DEFAULT_MAX_RATE_LIMIT_PAUSES: u32 = 10;

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Attempt number of the retry (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry timing.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 1 second, `max_delay`: 60 seconds, multiplier 2.0
/// - `max_jitter`: 2 seconds
/// - rate-limit pause: 30 seconds + up to 5 seconds jitter, at most 10 per item
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    max_jitter: Duration,
    rate_limit_pause: Duration,
    rate_limit_jitter: Duration,
    max_rate_limit_pauses: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
            rate_limit_pause: DEFAULT_RATE_LIMIT_PAUSE,
            rate_limit_jitter: DEFAULT_RATE_LIMIT_JITTER,
            max_rate_limit_pauses: DEFAULT_MAX_RATE_LIMIT_PAUSES,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom backoff settings and default rate-limit pauses.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the maximum backoff jitter.
    #[must_use]
    pub fn jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Replaces the rate-limit pause settings.
    #[must_use]
    pub fn rate_limit_pause(mut self, pause: Duration, jitter: Duration, max_pauses: u32) -> Self {
        self.rate_limit_pause = pause;
        self.rate_limit_jitter = jitter;
        self.max_rate_limit_pauses = max_pauses;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the bound on rate-limit pauses per item.
    #[must_use]
    pub fn max_rate_limit_pauses(&self) -> u32 {
        self.max_rate_limit_pauses
    }

    /// Decides whether to retry after attempt `attempt` (1-indexed) failed
    /// with an overload or transient error.
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.backoff_delay(attempt),
            attempt: attempt + 1,
        }
    }

    /// Decides whether to pause and retry after a rate-limit response.
    ///
    /// `pauses_taken` is the number of rate-limit pauses this item already
    /// slept through; `attempt` is the attempt number that was rate limited
    /// and is reused for the retry.
    #[instrument(level = "trace", skip(self))]
    pub fn should_pause(
        &self,
        attempt: u32,
        pauses_taken: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if pauses_taken >= self.max_rate_limit_pauses {
            warn!(
                pauses_taken,
                max = self.max_rate_limit_pauses,
                "rate-limit pause budget exhausted"
            );
            return RetryDecision::DoNotRetry {
                reason: format!(
                    "rate limited {} times in a row",
                    self.max_rate_limit_pauses
                ),
            };
        }

        RetryDecision::Retry {
            delay: self.rate_limit_delay(retry_after),
            attempt,
        }
    }

    /// Backoff before retrying after attempt `attempt`, without jitter.
    ///
    /// Non-decreasing in `attempt` and capped at the configured maximum.
    #[must_use]
    pub fn backoff_base(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * self.backoff_multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Backoff before retrying after attempt `attempt`, with jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base(attempt) + random_jitter(self.max_jitter)
    }

    /// Pause before retrying a rate-limited attempt.
    ///
    /// A server-provided Retry-After longer than the fixed pause wins.
    #[must_use]
    pub fn rate_limit_delay(&self, retry_after: Option<Duration>) -> Duration {
        let fixed = self.rate_limit_pause;
        let base = retry_after.map_or(fixed, |server| server.max(fixed));
        base + random_jitter(self.rate_limit_jitter)
    }
}

/// Generates random jitter between 0 and `max`.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(jitter_ms)
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-dates (RFC 7231). Returns `None` if
/// the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bulkfetch_core::transfer::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => {
            let duration = datetime
                .duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO);
            Some(duration.min(MAX_RETRY_AFTER))
        }
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
