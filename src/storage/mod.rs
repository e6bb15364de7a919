//! Storage primitives shared by every collection repository: pooling,
//! retry + circuit breaking, input sanitization, and the atomic scope.

pub mod circuit_breaker;
pub mod pool;
pub mod retry;
pub mod sanitize;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use pool::DbPool;
pub use retry::{with_retry, RetryPolicy};
pub use sanitize::{sanitize, sanitize_document};
