//! Client identification for inbound requests.
//!
//! Proxy headers win over transport addresses so that deployments behind a
//! reverse proxy count the original client rather than the proxy.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};

/// Identifier used when nothing about the client is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Client address already resolved by an upstream layer (for example a
/// trusted-proxy resolver), stored as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedClientAddr(pub IpAddr);

/// Derive the client identifier for a request.
///
/// First match wins: `x-forwarded-for` (first entry), `x-real-ip`, the
/// resolved address extension, the socket peer address, then `unknown`.
pub fn client_id<B>(req: &Request<B>) -> String {
    let headers = req.headers();

    forwarded_for(headers)
        .or_else(|| header_value(headers, "x-real-ip"))
        .or_else(|| {
            req.extensions()
                .get::<ResolvedClientAddr>()
                .map(|addr| addr.0.to_string())
        })
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// The leftmost `x-forwarded-for` entry is the original client.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}
