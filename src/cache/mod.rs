//! Shared counter backends.
//!
//! This module wraps the redis client so that rate limit counters can be
//! shared by every process pointing at the same Redis instance.

mod redis;

pub use self::redis::RedisCounter;
