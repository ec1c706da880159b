//! Shared-backend client wrapper.
//!
//! Owns the connection to a [`SharedCounter`], tracks its availability from
//! connection events and bounds every operation with a timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use super::backend::{ConnectionEvent, ConnectionListener, SharedCount, SharedCounter};
use super::key::CounterKey;
use crate::error::{LimiterError, Result};

/// A shared counter together with its availability state.
pub struct SharedBackend {
    client: Arc<dyn SharedCounter>,
    listener: ConnectionListener,
    key_prefix: String,
    op_timeout: Duration,
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("available", &self.is_available())
            .field("key_prefix", &self.key_prefix)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl SharedBackend {
    /// Wrap a shared counter. The backend is unavailable until it reports ready.
    pub fn new(client: Arc<dyn SharedCounter>, key_prefix: &str, op_timeout: Duration) -> Self {
        Self {
            client,
            listener: ConnectionListener::new(),
            key_prefix: key_prefix.to_string(),
            op_timeout,
        }
    }

    /// Start connecting in the background.
    pub fn connect(&self) {
        self.client.connect(self.listener.clone());
    }

    /// Close the connection; the backend is unavailable afterwards.
    pub async fn disconnect(&self) {
        self.client.disconnect().await;
        if self.listener.is_available() {
            self.listener.notify(ConnectionEvent::Closed);
        }
    }

    /// Whether the backend can currently be used.
    pub fn is_available(&self) -> bool {
        self.listener.is_available()
    }

    /// Mark the backend unusable until it reports ready again.
    pub fn mark_unavailable(&self, reason: &str) {
        self.listener.notify(ConnectionEvent::Error(reason.to_string()));
    }

    /// Increment the shared counter for `key`.
    ///
    /// Errors and timeouts both mark the backend unavailable before they are
    /// returned.
    pub async fn increment(&self, key: &CounterKey, window: Duration) -> Result<SharedCount> {
        let shared_key = key.to_shared_key(&self.key_prefix);
        trace!(key = %shared_key, "Incrementing shared counter");

        let result = match tokio::time::timeout(self.op_timeout, self.client.increment(&shared_key, window)).await {
            Ok(result) => result,
            Err(_) => Err(LimiterError::Timeout(self.op_timeout)),
        };

        if let Err(ref e) = result {
            warn!(key = %shared_key, error = %e, "Shared counter increment failed");
            self.mark_unavailable(&e.to_string());
        }
        result
    }
}
