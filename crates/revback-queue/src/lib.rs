pub mod alerts;
pub mod circuit_breaker;
pub mod job;
pub mod rate_limiter;
pub mod scheduler;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use job::{JobQueue, QueueConfig};
pub use rate_limiter::{RateLimitTier, RateLimiter};
