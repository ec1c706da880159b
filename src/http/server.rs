//! HTTP server wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit;
use crate::config::BackendMode;
use crate::error::Result;
use crate::ratelimit::{ActiveBackend, RateLimiter};

/// Snapshot of the limiter returned by `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub running: bool,
    pub mode: BackendMode,
    pub backend: ActiveBackend,
    pub local_counters: usize,
}

async fn status(State(limiter): State<Arc<RateLimiter>>) -> Json<StatusBody> {
    Json(StatusBody {
        running: limiter.is_running(),
        mode: limiter.settings().mode,
        backend: limiter.backend(),
        local_counters: limiter.local().len(),
    })
}

/// Build the application router with every route behind the rate limiter.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/status", get(status))
        .layer(middleware::from_fn_with_state(limiter.clone(), rate_limit))
        .with_state(limiter)
}

/// HTTP server guarded by a rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    ///
    /// Peer addresses are recorded so the limiter can identify unproxied clients.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "HTTP server listening");

        axum::serve(
            listener,
            router(self.limiter).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
