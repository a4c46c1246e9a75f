pub mod cache;
pub mod circuit_breaker;
pub mod rate_limit;

pub use cache::{CacheService, CacheTtl};
pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use rate_limit::{FeatureLimits, SlidingWindowLimiter, TokenBucket, WindowDecision};
