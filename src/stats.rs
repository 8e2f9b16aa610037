//! Run statistics: monotonically increasing counters, throughput and ETA.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Items transferred successfully.
    pub success: u64,
    /// Items that exhausted their retry budget.
    pub failed: u64,
    /// Items the remote reported as absent.
    pub not_found: u64,
    /// Items rejected because the session expired.
    pub credential_expired: u64,
    /// Retries scheduled (backoffs plus rate-limit pauses).
    pub retries: u64,
    /// Rate-limit responses seen.
    pub rate_limited: u64,
    /// Payload bytes transferred.
    pub bytes: u64,
}

impl Counters {
    /// Items that reached a terminal outcome.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.success + self.failed + self.not_found + self.credential_expired
    }
}

/// Shared run statistics.
///
/// Written by every worker, read by the orchestrator and progress display.
/// All counters live behind one mutex so a snapshot is consistent.
#[derive(Debug)]
pub struct Statistics {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Statistics {
    /// Starts the clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counters);
    }

    /// Records a successful transfer of `bytes`.
    pub fn record_success(&self, bytes: u64) {
        self.update(|c| {
            c.success += 1;
            c.bytes += bytes;
        });
    }

    /// Records an exhausted item.
    pub fn record_failure(&self) {
        self.update(|c| c.failed += 1);
    }

    /// Records a not-found item.
    pub fn record_not_found(&self) {
        self.update(|c| c.not_found += 1);
    }

    /// Records an item rejected for stale credentials.
    pub fn record_credential_expired(&self) {
        self.update(|c| c.credential_expired += 1);
    }

    /// Records one scheduled retry.
    pub fn record_retry(&self) {
        self.update(|c| c.retries += 1);
    }

    /// Records one rate-limit response.
    pub fn record_rate_limited(&self) {
        self.update(|c| c.rate_limited += 1);
    }

    /// Current counters.
    #[must_use]
    pub fn counters(&self) -> Counters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the statistics were created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Snapshot with derived throughput and an ETA for `remaining` items.
    #[must_use]
    pub fn snapshot(&self, remaining: u64) -> StatsSnapshot {
        StatsSnapshot::derive(self.counters(), self.elapsed(), remaining)
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters plus derived rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    /// Raw counters.
    pub counters: Counters,
    /// Wall time since start.
    pub elapsed: Duration,
    /// Terminal items per second.
    pub items_per_sec: f64,
    /// Payload bytes per second.
    pub bytes_per_sec: f64,
    /// Estimated time to finish the remaining items, when a rate is known.
    pub eta: Option<Duration>,
}

impl StatsSnapshot {
    /// Derives rates from raw counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn derive(counters: Counters, elapsed: Duration, remaining: u64) -> Self {
        let secs = elapsed.as_secs_f64();
        let (items_per_sec, bytes_per_sec) = if secs > 0.0 {
            (
                counters.processed() as f64 / secs,
                counters.bytes as f64 / secs,
            )
        } else {
            (0.0, 0.0)
        };
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if items_per_sec > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / items_per_sec))
        } else {
            None
        };
        Self {
            counters,
            elapsed,
            items_per_sec,
            bytes_per_sec,
            eta,
        }
    }
}

/// Formats a duration as `1h02m03s`, `2m03s` or `3s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Formats a byte count with binary units.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
