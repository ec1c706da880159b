//! In-process fixed-window counter store.
//!
//! Each (client, method) key owns one [`CounterEntry`]. A window opens on the
//! first request for a key and closes at `reset_at`; the next request after
//! that opens a fresh window. A burst straddling a window boundary can admit
//! up to twice the limit, which is inherent to fixed windows.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::limiter::Admission;

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Admitted requests in this window
    pub count: u64,
    /// When this window closes
    pub reset_at: Instant,
}

impl CounterEntry {
    fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.reset_at
    }
}

/// Thread-safe map of counters, owned by a single limiter.
///
/// The check for one key runs entirely under that key's shard lock, so two
/// concurrent requests can never both observe an expired entry and both
/// reset it.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl LocalCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key` and decide whether it is admitted.
    ///
    /// Denied requests leave the count untouched.
    pub fn check(&self, key: &str, limit: u64, window: Duration) -> Admission {
        self.check_at(key, limit, window, Instant::now())
    }

    fn check_at(&self, key: &str, limit: u64, window: Duration, now: Instant) -> Admission {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                reset_at: now,
            });

        if entry.count == 0 || entry.is_expired(now) {
            trace!(key, "Opening rate limit window");
            *entry = CounterEntry::open(now, window);
            return Admission::Allowed;
        }

        if entry.count >= limit {
            let remaining = entry.reset_at.saturating_duration_since(now);
            let retry_after = ceil_secs(remaining).max(1);
            debug!(key, count = entry.count, limit, retry_after, "Local rate limit exceeded");
            return Admission::Denied { retry_after };
        }

        entry.count += 1;
        Admission::Allowed
    }

    /// Remove every entry whose window closed before `now`.
    ///
    /// Returns how many entries were removed. Running it with nothing
    /// expired changes nothing.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired rate limit counters");
        }
        removed
    }

    /// Current entry for a key, if any.
    pub fn get(&self, key: &str) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Current count for a key, if any.
    pub fn count(&self, key: &str) -> Option<u64> {
        self.get(key).map(|entry| entry.count)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000) as u64
}
