//! Middleware applying the rate limiter to every request.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use super::response::{request_id, Rejection};
use crate::ratelimit::{client_id, RateLimiter};

/// Admit or reject a request before any handler runs.
///
/// Quota denials become 429 responses and backend outages 503 responses,
/// both carrying a `Retry-After` header and a JSON envelope.
#[instrument(
    skip_all,
    fields(method = %req.method(), path = %req.uri().path())
)]
pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    let client = client_id(&req);

    match limiter.admit(req.method().as_str(), &client).await.into_result() {
        Ok(()) => next.run(req).await,
        Err(violation) => {
            debug!(
                client = %client,
                code = violation.code(),
                retry_after = violation.retry_after(),
                "Request rejected by rate limiter"
            );
            Rejection::new(violation, request_id(req.headers())).into_response()
        }
    }
}
