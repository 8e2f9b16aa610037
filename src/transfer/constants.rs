//! Constants for the transfer module (timeouts, backoff, rate limiting).

use std::time::Duration;

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-attempt request timeout (60 seconds, whole request including body).
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Browser User-Agent sent with every request.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Suffix of in-progress payload files; never matched by the destination scan.
pub const PARTIAL_SUFFIX: &str = ".part";
