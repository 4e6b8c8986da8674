//! Retry and circuit breaking combined

use super::circuit_breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use crate::error::Result;
use std::future::Future;
use std::sync::Arc;

/// Optional retry around an optional breaker.
///
/// Each attempt goes through the breaker first. A rejected attempt surfaces as
/// `CircuitOpen`, which the retry policy never retries.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePolicy {
    pub retry: Option<RetryPolicy>,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

impl ResiliencePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.retry {
            Some(retry) => retry.retry_result(|| self.attempt(&operation)).await,
            None => self.attempt(&operation).await,
        }
    }

    async fn attempt<T, F, Fut>(&self, operation: &F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breaker {
            Some(breaker) => Ok(breaker.call(operation).await?),
            None => operation().await,
        }
    }
}
