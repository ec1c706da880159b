//! Turnstile - Fixed-Window Request Rate Limiting
//!
//! This crate limits how many requests each client may make per time window,
//! keyed by client address and HTTP method. Counts live either in process
//! memory or in a shared Redis instance, with an optional fallback to memory
//! when the shared backend is unreachable.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

#[cfg(test)]
mod test_utils;
