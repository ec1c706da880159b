//! HTTP integration for the rate limiter.

mod middleware;
mod response;
mod server;

pub use middleware::rate_limit;
pub use response::{request_id, Rejection, RejectionBody};
pub use server::{router, HttpServer, StatusBody};
