//! Shared counter backend abstraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

/// Counter state reported by the shared backend after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedCount {
    /// Value of the counter after this increment
    pub count: u64,
    /// Seconds until the counter expires, if the backend could report it
    pub ttl: Option<u64>,
}

/// Connection lifecycle notifications emitted by a shared backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection passed its readiness check
    Ready,
    /// The connection failed
    Error(String),
    /// The connection was closed
    Closed,
}

/// Receives [`ConnectionEvent`]s and tracks whether the backend is usable.
///
/// The flag changes inside [`ConnectionListener::notify`] itself, so readers
/// see an event as soon as the backend has delivered it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionListener {
    available: Arc<AtomicBool>,
}

impl ConnectionListener {
    /// Create a listener that starts out unavailable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection event.
    pub fn notify(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ready => {
                self.available.store(true, Ordering::SeqCst);
                info!("Rate limiter connected to shared backend");
            }
            ConnectionEvent::Error(reason) => {
                self.available.store(false, Ordering::SeqCst);
                warn!(reason = %reason, "Rate limiter shared backend error");
            }
            ConnectionEvent::Closed => {
                self.available.store(false, Ordering::SeqCst);
                warn!("Rate limiter shared backend connection ended");
            }
        }
    }

    /// Whether the last event left the backend usable.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// A networked atomic counter service.
///
/// Implementations must make `increment` atomic: the returned count reflects
/// this increment and no concurrent caller can observe the same value.
#[async_trait]
pub trait SharedCounter: Send + Sync {
    /// Begin connecting without waiting on network I/O.
    ///
    /// Lifecycle changes are reported through `listener` from then on.
    fn connect(&self, listener: ConnectionListener);

    /// Increment `key` by one, setting it to expire after `window` only when
    /// it has no expiry yet.
    async fn increment(&self, key: &str, window: Duration) -> Result<SharedCount>;

    /// Close the connection and stop any background work.
    async fn disconnect(&self);
}
