//! Admission decision engine.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::{SharedCount, SharedCounter};
use super::counter::LocalCounterStore;
use super::key::{CounterKey, MethodClass};
use super::shared::SharedBackend;
use crate::cache::RedisCounter;
use crate::config::{LimiterSettings, WindowPolicy};
use crate::error::{RateLimitViolation, Result};

/// How often expired local counters are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Retry hint returned while the shared backend is unreachable.
const UNAVAILABLE_RETRY_AFTER: u64 = 1;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed
    Allowed,
    /// The client is over quota for this window
    Denied { retry_after: u64 },
    /// The shared backend is required but unreachable
    Unavailable { retry_after: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Convert into a result carrying the typed violation on rejection.
    pub fn into_result(self) -> std::result::Result<(), RateLimitViolation> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after } => Err(RateLimitViolation::QuotaExceeded { retry_after }),
            Admission::Unavailable { retry_after } => {
                Err(RateLimitViolation::BackendUnavailable { retry_after })
            }
        }
    }
}

/// Which path an admission check would take right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveBackend {
    Local,
    Shared,
    Unavailable,
}

/// Sweep timers created and cancelled over the limiter's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub created: usize,
    pub cancelled: usize,
}

enum Lifecycle {
    Stopped,
    Running(SweepTask),
}

struct SweepTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-process rate limiter.
///
/// Counts live in the shared backend when the resolved mode asks for it and
/// in an owned local store otherwise (or as a fallback, when permitted).
/// The host calls [`RateLimiter::start`] once at startup and
/// [`RateLimiter::stop`] once at shutdown.
pub struct RateLimiter {
    settings: LimiterSettings,
    local: Arc<LocalCounterStore>,
    shared: Option<SharedBackend>,
    lifecycle: Mutex<Lifecycle>,
    sweep_interval: Duration,
    timers_created: AtomicUsize,
    timers_cancelled: AtomicUsize,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("shared", &self.shared)
            .field("running", &self.is_running())
            .field("local_counters", &self.local.len())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter, building a Redis client when the resolved mode needs one.
    ///
    /// No network I/O happens here; the connection is opened by `start`.
    pub fn new(settings: LimiterSettings) -> Result<Self> {
        let client: Option<Arc<dyn SharedCounter>> = if settings.uses_shared_backend() {
            Some(Arc::new(RedisCounter::new(&settings.redis)?))
        } else {
            None
        };
        Ok(Self::build(settings, client))
    }

    /// Create a limiter around an existing shared counter.
    ///
    /// The counter is only used if the resolved mode selects the shared backend.
    pub fn with_shared_counter(settings: LimiterSettings, client: Arc<dyn SharedCounter>) -> Self {
        let client = settings.uses_shared_backend().then_some(client);
        Self::build(settings, client)
    }

    fn build(settings: LimiterSettings, client: Option<Arc<dyn SharedCounter>>) -> Self {
        let shared = client
            .map(|client| SharedBackend::new(client, &settings.key_prefix, settings.redis.op_timeout));

        info!(
            mode = ?settings.mode,
            environment = %settings.environment,
            shared = shared.is_some(),
            memory_fallback = settings.memory_fallback,
            "Rate limiter configured"
        );

        Self {
            settings,
            local: Arc::new(LocalCounterStore::new()),
            shared,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            sweep_interval: SWEEP_INTERVAL,
            timers_created: AtomicUsize::new(0),
            timers_cancelled: AtomicUsize::new(0),
        }
    }

    /// Override the sweep period.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Start the sweep timer and begin connecting to the shared backend.
    ///
    /// Must be called from within a tokio runtime. Calling it while already
    /// running does nothing.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            debug!("Rate limiter already running");
            return;
        }

        let cancel = CancellationToken::new();
        let first_tick = Instant::now() + self.sweep_interval;
        let local = self.local.clone();
        let handle = tokio::spawn(sweep_loop(
            first_tick,
            self.sweep_interval,
            cancel.clone(),
            move |now| local.sweep(now),
        ));
        *lifecycle = Lifecycle::Running(SweepTask { cancel, handle });
        self.timers_created.fetch_add(1, Ordering::SeqCst);

        if let Some(shared) = &self.shared {
            shared.connect();
        }

        info!(sweep_interval = ?self.sweep_interval, "Rate limiter started");
    }

    /// Cancel the sweep timer and close the shared backend connection.
    ///
    /// Safe to call when not running, and safe to call repeatedly.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let Lifecycle::Running(task) = previous else {
            debug!("Rate limiter not running");
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Sweep task ended abnormally");
        }
        self.timers_cancelled.fetch_add(1, Ordering::SeqCst);

        if let Some(shared) = &self.shared {
            shared.disconnect().await;
        }

        info!("Rate limiter stopped");
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    pub fn timer_stats(&self) -> TimerStats {
        TimerStats {
            created: self.timers_created.load(Ordering::SeqCst),
            cancelled: self.timers_cancelled.load(Ordering::SeqCst),
        }
    }

    /// Decide whether a request from `client_id` using `method` is admitted.
    ///
    /// Never fails: backend trouble becomes either a local check or
    /// [`Admission::Unavailable`], depending on the fallback setting.
    pub async fn admit(&self, method: &str, client_id: &str) -> Admission {
        let policy = self.settings.policy_for(MethodClass::of(method));
        let key = CounterKey::new(client_id, method);

        trace!(key = %key, limit = policy.limit, window = policy.window_secs, "Checking rate limit");

        if let Some(shared) = &self.shared {
            if shared.is_available() {
                if let Ok(state) = shared.increment(&key, policy.window()).await {
                    return decide_shared(&key, state, policy);
                }
            }

            if !self.settings.memory_fallback {
                warn!(
                    key = %key,
                    "Shared backend unavailable and memory fallback disabled, rejecting request"
                );
                return Admission::Unavailable {
                    retry_after: UNAVAILABLE_RETRY_AFTER,
                };
            }

            debug!(key = %key, "Shared backend unavailable, using in-memory fallback");
        }

        self.local.check(&key.to_local_key(), policy.limit, policy.window())
    }

    /// The path an admission check would take at this moment.
    pub fn backend(&self) -> ActiveBackend {
        match &self.shared {
            None => ActiveBackend::Local,
            Some(shared) if shared.is_available() => ActiveBackend::Shared,
            Some(_) if self.settings.memory_fallback => ActiveBackend::Local,
            Some(_) => ActiveBackend::Unavailable,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// The local counter store, used directly or as fallback.
    pub fn local(&self) -> &LocalCounterStore {
        &self.local
    }
}

fn decide_shared(key: &CounterKey, state: SharedCount, policy: WindowPolicy) -> Admission {
    if state.count <= policy.limit {
        return Admission::Allowed;
    }

    let retry_after = state.ttl.filter(|ttl| *ttl > 0).unwrap_or(policy.window_secs);
    debug!(
        key = %key,
        count = state.count,
        limit = policy.limit,
        retry_after,
        "Shared rate limit exceeded"
    );
    Admission::Denied { retry_after }
}

/// Run `sweep` every `period`, starting at `first_tick`, until cancelled.
///
/// A panic inside one sweep is logged and the loop keeps ticking.
async fn sweep_loop<F>(first_tick: Instant, period: Duration, cancel: CancellationToken, mut sweep: F)
where
    F: FnMut(Instant) -> usize + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let swept = std::panic::catch_unwind(AssertUnwindSafe(|| sweep(Instant::now())));
                if swept.is_err() {
                    warn!("Rate limit sweep panicked, will retry on next tick");
                }
            }
        }
    }

    trace!("Sweep task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ConnectionEvent;
    use crate::test_utils::MockCounter;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> LimiterSettings {
        let source: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LimiterSettings::from_source(&source)
    }

    fn memory_limiter(pairs: &[(&str, &str)]) -> RateLimiter {
        let mut pairs = pairs.to_vec();
        pairs.push(("RATE_LIMIT_STORE", "memory"));
        assert_ok(RateLimiter::new(settings(&pairs)))
    }

    fn assert_ok<T>(result: Result<T>) -> T {
        tokio_test::assert_ok!(result)
    }

    fn shared_limiter(pairs: &[(&str, &str)]) -> (RateLimiter, Arc<MockCounter>) {
        let mock = Arc::new(MockCounter::new());
        let limiter = RateLimiter::with_shared_counter(settings(pairs), mock.clone());
        (limiter, mock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutating_window_scenario() {
        let limiter = memory_limiter(&[("RATE_LIMIT_POST_MAX", "20"), ("RATE_LIMIT_POST_WINDOW", "60")]);

        for i in 1..=20 {
            assert_eq!(limiter.admit("POST", "client-x").await, Admission::Allowed, "request {i}");
        }

        tokio::time::advance(Duration::from_millis(900)).await;
        match limiter.admit("POST", "client-x").await {
            Admission::Denied { retry_after } => assert!((59..=60).contains(&retry_after)),
            other => panic!("expected denial, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.admit("POST", "client-x").await, Admission::Allowed);
        assert_eq!(limiter.local().count("client-x:POST"), Some(1));
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_denied() {
        let limiter = memory_limiter(&[]);

        for _ in 0..50 {
            assert!(limiter.admit("GET", "10.0.0.1").await.is_allowed());
        }
        match limiter.admit("GET", "10.0.0.1").await {
            Admission::Denied { retry_after } => assert!(retry_after > 0),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clients_are_counted_separately() {
        let limiter = memory_limiter(&[("RATE_LIMIT_POST_MAX", "2")]);

        for _ in 0..2 {
            limiter.admit("POST", "client-a").await;
        }
        assert!(!limiter.admit("POST", "client-a").await.is_allowed());
        assert!(limiter.admit("POST", "client-b").await.is_allowed());
    }

    #[tokio::test]
    async fn test_methods_are_counted_separately() {
        let limiter = memory_limiter(&[("RATE_LIMIT_GET_MAX", "3")]);

        for _ in 0..3 {
            limiter.admit("GET", "client").await;
        }
        assert!(!limiter.admit("get", "client").await.is_allowed());
        assert!(limiter.admit("POST", "client").await.is_allowed());
    }

    #[tokio::test]
    async fn test_into_result_maps_outcomes() {
        assert_eq!(Admission::Allowed.into_result(), Ok(()));
        assert_eq!(
            Admission::Denied { retry_after: 12 }.into_result(),
            Err(RateLimitViolation::QuotaExceeded { retry_after: 12 })
        );
        assert_eq!(
            Admission::Unavailable { retry_after: 1 }.into_result(),
            Err(RateLimitViolation::BackendUnavailable { retry_after: 1 })
        );
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let limiter = memory_limiter(&[]);
        limiter.stop().await;
        limiter.stop().await;

        assert!(!limiter.is_running());
        assert_eq!(limiter.timer_stats(), TimerStats::default());
    }

    #[tokio::test]
    async fn test_repeated_cycles_do_not_accumulate_timers() {
        let limiter = memory_limiter(&[]);

        for cycle in 1..=3 {
            limiter.start();
            assert!(limiter.is_running());
            limiter.stop().await;
            limiter.stop().await;
            assert!(!limiter.is_running());
            assert_eq!(limiter.timer_stats(), TimerStats { created: cycle, cancelled: cycle });
        }
    }

    #[tokio::test]
    async fn test_double_start_creates_one_timer() {
        let limiter = memory_limiter(&[]);
        limiter.start();
        limiter.start();
        assert_eq!(limiter.timer_stats().created, 1);
        limiter.stop().await;
        assert_eq!(limiter.timer_stats(), TimerStats { created: 1, cancelled: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_while_started() {
        let limiter = memory_limiter(&[
            ("RATE_LIMIT_GET_WINDOW", "1"),
            ("RATE_LIMIT_POST_WINDOW", "600"),
        ]);
        limiter.start();

        limiter.admit("GET", "short-lived").await;
        limiter.admit("POST", "long-lived").await;
        assert_eq!(limiter.local().len(), 2);

        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(limiter.local().get("short-lived:GET").is_none());
        assert!(limiter.local().get("long-lived:POST").is_some());

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sweep_is_anchored_at_start() {
        let limiter = memory_limiter(&[("RATE_LIMIT_GET_WINDOW", "1")]);
        limiter.start();
        limiter.admit("GET", "client").await;

        // The sweep task has not been polled yet; its deadline must still count from start.
        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(limiter.local().is_empty());
        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sweep_does_not_end_loop() {
        let local = Arc::new(LocalCounterStore::new());
        let period = Duration::from_secs(10);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let store = local.clone();
        let seen = calls.clone();
        let handle = tokio::spawn(sweep_loop(
            Instant::now() + period,
            period,
            cancel.clone(),
            move |now| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("sweep failed");
                }
                store.sweep(now)
            },
        ));

        local.check("k", 5, Duration::from_secs(1));

        tokio::time::advance(period + Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(local.len(), 1);

        tokio::time::advance(period).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(local.is_empty());

        cancel.cancel();
        tokio_test::assert_ok!(handle.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweep_after_stop() {
        let limiter = memory_limiter(&[("RATE_LIMIT_GET_WINDOW", "1")]);
        limiter.start();
        limiter.stop().await;

        limiter.admit("GET", "client").await;
        tokio::time::advance(SWEEP_INTERVAL * 3).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(limiter.local().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_backend_counts_and_denies() {
        let (limiter, mock) = shared_limiter(&[
            ("APP_ENV", "production"),
            ("RATE_LIMIT_POST_MAX", "2"),
        ]);
        limiter.start();
        mock.emit(ConnectionEvent::Ready);
        assert_eq!(limiter.backend(), ActiveBackend::Shared);

        assert!(limiter.admit("POST", "client").await.is_allowed());
        assert!(limiter.admit("POST", "client").await.is_allowed());
        match limiter.admit("POST", "client").await {
            Admission::Denied { retry_after } => assert!((1..=60).contains(&retry_after)),
            other => panic!("expected denial, got {other:?}"),
        }

        assert_eq!(mock.count("rate_limit:client:POST"), Some(3));
        assert!(limiter.local().is_empty());

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_unavailable_without_fallback_until_ready() {
        let (limiter, mock) = shared_limiter(&[
            ("RATE_LIMIT_STORE", "shared"),
            ("RATE_LIMIT_MEMORY_FALLBACK", "false"),
        ]);
        limiter.start();

        mock.emit(ConnectionEvent::Ready);
        assert!(limiter.admit("GET", "client").await.is_allowed());

        mock.emit(ConnectionEvent::Error("connection reset".to_string()));
        assert_eq!(limiter.backend(), ActiveBackend::Unavailable);
        for _ in 0..3 {
            assert_eq!(
                limiter.admit("GET", "client").await,
                Admission::Unavailable { retry_after: 1 }
            );
        }

        mock.emit(ConnectionEvent::Ready);
        assert!(limiter.admit("GET", "client").await.is_allowed());
        assert!(limiter.local().is_empty());

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_failed_increment_falls_back_to_local() {
        let (limiter, mock) = shared_limiter(&[
            ("RATE_LIMIT_STORE", "shared"),
            ("RATE_LIMIT_MEMORY_FALLBACK", "true"),
        ]);
        limiter.start();
        mock.emit(ConnectionEvent::Ready);
        mock.set_failing(true);

        assert!(limiter.admit("POST", "client").await.is_allowed());
        assert_eq!(limiter.local().count("client:POST"), Some(1));
        assert_eq!(limiter.backend(), ActiveBackend::Local);

        // Unavailable now, so the shared client is not retried.
        assert!(limiter.admit("POST", "client").await.is_allowed());
        assert_eq!(mock.increments(), 1);
        assert_eq!(limiter.local().count("client:POST"), Some(2));

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_failed_increment_without_fallback_is_unavailable() {
        let (limiter, mock) = shared_limiter(&[
            ("RATE_LIMIT_STORE", "shared"),
            ("RATE_LIMIT_MEMORY_FALLBACK", "no"),
        ]);
        limiter.start();
        mock.emit(ConnectionEvent::Ready);
        mock.set_failing(true);

        assert_eq!(
            limiter.admit("POST", "client").await,
            Admission::Unavailable { retry_after: 1 }
        );
        assert!(limiter.local().is_empty());

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_auto_mode_in_development_never_touches_shared() {
        let (limiter, mock) = shared_limiter(&[("APP_ENV", "development")]);
        limiter.start();
        mock.emit(ConnectionEvent::Ready);

        assert!(limiter.admit("GET", "client").await.is_allowed());
        assert_eq!(limiter.backend(), ActiveBackend::Local);
        assert_eq!(mock.connects(), 0);
        assert_eq!(mock.increments(), 0);

        limiter.stop().await;
        assert_eq!(mock.disconnects(), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_outside_development_uses_shared() {
        let (limiter, mock) = shared_limiter(&[("APP_ENV", "production")]);
        limiter.start();
        assert_eq!(mock.connects(), 1);
        mock.emit(ConnectionEvent::Ready);

        assert!(limiter.admit("GET", "client").await.is_allowed());
        assert_eq!(mock.increments(), 1);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_shared_connection() {
        let (limiter, mock) = shared_limiter(&[
            ("RATE_LIMIT_STORE", "shared"),
            ("RATE_LIMIT_MEMORY_FALLBACK", "false"),
        ]);
        limiter.start();
        mock.emit(ConnectionEvent::Ready);

        limiter.stop().await;
        assert_eq!(mock.disconnects(), 1);
        assert_eq!(limiter.backend(), ActiveBackend::Unavailable);
        assert!(!limiter.admit("GET", "client").await.is_allowed());

        limiter.stop().await;
        assert_eq!(mock.disconnects(), 1);
    }

    #[test]
    fn test_shared_denial_uses_ttl_or_window() {
        let key = CounterKey::new("client", "POST");
        let policy = WindowPolicy { limit: 1, window_secs: 60 };

        let denied = decide_shared(&key, SharedCount { count: 2, ttl: Some(17) }, policy);
        assert_eq!(denied, Admission::Denied { retry_after: 17 });

        let no_ttl = decide_shared(&key, SharedCount { count: 2, ttl: None }, policy);
        assert_eq!(no_ttl, Admission::Denied { retry_after: 60 });

        let allowed = decide_shared(&key, SharedCount { count: 1, ttl: Some(59) }, policy);
        assert_eq!(allowed, Admission::Allowed);
    }
}
