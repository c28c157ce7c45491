//! Sliding-window rate limiting over the shared store.

mod identity;
mod limiter;
mod policy;
mod sweeper;

pub use identity::{ClientIdentity, FORWARDED_FOR_HEADER, UNKNOWN_IDENTITY};
pub use limiter::{Decision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use policy::{
    PolicyRegistry, RateLimitPolicy, EXPENSIVE_CATEGORY, MAX_WINDOW_SECS, STANDARD_CATEGORY,
};
pub use sweeper::{ExpirySweeper, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
