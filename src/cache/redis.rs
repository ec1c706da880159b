//! Redis-backed shared counter.
//!
//! Connections are opened lazily by a monitor task spawned from `connect`.
//! The monitor establishes a `ConnectionManager`, runs a `PING` readiness
//! check, and keeps probing so the limiter learns both about failures and
//! about recovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RedisSettings;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{ConnectionEvent, ConnectionListener, SharedCount, SharedCounter};

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on establishing a connection plus its readiness check.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Increments the counter and sets its expiry only when it has none, so that
/// a window is never extended by later requests. Returns `{count, ttl}`.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

type ConnectionSlot = Arc<RwLock<Option<ConnectionManager>>>;

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A [`SharedCounter`] stored in Redis.
pub struct RedisCounter {
    client: Client,
    connection: ConnectionSlot,
    monitor: Mutex<Option<Monitor>>,
    script: Script,
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter")
            .field("connected", &self.connection.read().is_some())
            .field("monitoring", &self.monitor.lock().is_some())
            .finish()
    }
}

impl RedisCounter {
    /// Build a client from connection settings. Performs no network I/O.
    pub fn new(settings: &RedisSettings) -> Result<Self> {
        let client = Client::open(settings.url().as_str())
            .map_err(|e| LimiterError::Config(format!("Invalid Redis connection settings: {}", e)))?;

        debug!(
            host = %settings.host,
            port = settings.port,
            db = settings.db,
            tls = settings.tls,
            "Created Redis client for rate limiting"
        );

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            monitor: Mutex::new(None),
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl SharedCounter for RedisCounter {
    fn connect(&self, listener: ConnectionListener) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            debug!("Redis monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_connection(
            self.client.clone(),
            self.connection.clone(),
            listener,
            cancel.clone(),
        ));
        *monitor = Some(Monitor { cancel, handle });
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<SharedCount> {
        let connection = self.connection.read().clone();
        let Some(mut conn) = connection else {
            return Err(LimiterError::NotConnected);
        };

        let (count, ttl): (u64, i64) = self
            .script
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        Ok(SharedCount {
            count,
            ttl: u64::try_from(ttl).ok().filter(|ttl| *ttl > 0),
        })
    }

    async fn disconnect(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            let _ = monitor.handle.await;
        }
        self.connection.write().take();
    }
}

async fn monitor_connection(
    client: Client,
    connection: ConnectionSlot,
    listener: ConnectionListener,
    cancel: CancellationToken,
) {
    let mut failure_reported = false;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = probe(&client, &connection) => outcome,
        };

        match outcome {
            Ok(()) => {
                failure_reported = false;
                if !listener.is_available() {
                    listener.notify(ConnectionEvent::Ready);
                }
            }
            Err(e) => {
                if listener.is_available() || !failure_reported {
                    listener.notify(ConnectionEvent::Error(e.to_string()));
                }
                failure_reported = true;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }

    connection.write().take();
    listener.notify(ConnectionEvent::Closed);
    info!("Redis connection for rate limiting closed");
}

/// Connect if needed, then check the connection answers `PING`.
async fn probe(client: &Client, connection: &ConnectionSlot) -> Result<()> {
    let check = async {
        let existing = connection.read().clone();
        let mut conn = match existing {
            Some(conn) => conn,
            None => {
                let config = ConnectionManagerConfig::new().set_number_of_retries(1);
                let conn = client.get_connection_manager_with_config(config).await?;
                *connection.write() = Some(conn.clone());
                conn
            }
        };

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok::<(), LimiterError>(())
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, check).await {
        Ok(result) => result,
        Err(_) => Err(LimiterError::Timeout(CONNECT_TIMEOUT)),
    }
}
