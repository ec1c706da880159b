//! Test doubles shared across unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{ConnectionEvent, ConnectionListener, SharedCount, SharedCounter};

/// In-memory stand-in for the shared counter service.
///
/// Connection events are only delivered when a test calls [`MockCounter::emit`].
#[derive(Default)]
pub(crate) struct MockCounter {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
    listener: Mutex<Option<ConnectionListener>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    increments: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Deliver a connection event to the registered listener.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener.notify(event);
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn count(&self, key: &str) -> Option<u64> {
        self.counters.lock().get(key).map(|(count, _)| *count)
    }

    pub(crate) fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedCounter for MockCounter {
    fn connect(&self, listener: ConnectionListener) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock() = Some(listener);
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<SharedCount> {
        self.increments.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LimiterError::NotConnected);
        }

        let now = Instant::now();
        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        if now >= entry.1 {
            *entry = (0, now + window);
        }
        entry.0 += 1;

        let ttl = entry.1.saturating_duration_since(now).as_secs();
        Ok(SharedCount {
            count: entry.0,
            ttl: (ttl > 0).then_some(ttl),
        })
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().take() {
            listener.notify(ConnectionEvent::Closed);
        }
    }
}
