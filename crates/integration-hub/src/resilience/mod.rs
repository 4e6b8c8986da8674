//! Reliability layer: retry, circuit breaking and error handling

pub mod circuit_breaker;
pub mod error_handler;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics,
    CircuitBreakerRegistry, CircuitState,
};
pub use error_handler::{ErrorHandler, ErrorRecord, ErrorStats};
pub use policy::ResiliencePolicy;
pub use retry::{BackoffStrategy, RetryPolicy, RetryResult};
