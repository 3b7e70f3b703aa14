#![forbid(unsafe_code)]

mod cache;
mod entry;
mod flight;
pub mod limiter;
mod stats;

pub use cache::{CacheConfig, TtlCache};
pub use limiter::{RateLimitConfig, SlidingWindowLimiter};
pub use stats::CacheStats;
