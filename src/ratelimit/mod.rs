//! Rate limiting logic and state management.

mod backend;
mod client;
mod counter;
mod key;
mod limiter;
mod shared;

pub use backend::{ConnectionEvent, ConnectionListener, SharedCount, SharedCounter};
pub use client::{client_id, ResolvedClientAddr, UNKNOWN_CLIENT};
pub use counter::{CounterEntry, LocalCounterStore};
pub use key::{CounterKey, MethodClass};
pub use limiter::{ActiveBackend, Admission, RateLimiter, TimerStats, SWEEP_INTERVAL};
pub use shared::SharedBackend;
