//! Per-key admission control for outbound calls.
//!
//! Two algorithms are available, selected per key when its rule is registered:
//!
//! - **Fixed window**: `max_requests` per `interval`, reset at hard boundaries
//! - **Token bucket**: continuous refill at `max_requests / interval`, with a
//!   burst capacity of `max_requests`

pub mod budget;
pub mod limiter;

pub use budget::{Budget, RateLimitRule, RateLimitStrategy};
pub use limiter::{
    default_rules, KeyStats, RateLimiter, PROCESSING_KEY, PUBLISH_KEY, SCRAPING_KEY,
};
