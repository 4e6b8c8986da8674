//! Retry with configurable backoff
//!
//! `max_attempts` counts every call, the first one included. Delays are
//! computed per retry (0-indexed) and always capped at `max_delay`.

use crate::error::{ErrorKind, IntegrationError, Result};
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay * multiplier^retry`
    #[default]
    Exponential,
    /// `initial_delay + retry * increment`
    Linear,
    /// Uniform in `[initial_delay, max_delay]`
    Random,
    /// Retry immediately
    None,
}

/// Retry behaviour for an operation returning [`IntegrationError`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub increment: Duration,
    pub strategy: BackoffStrategy,
    /// When non-empty, only these kinds are retried
    pub retry_on: Vec<ErrorKind>,
    /// Kinds that are never retried
    pub no_retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            increment: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
            retry_on: Vec::new(),
            no_retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            strategy: BackoffStrategy::None,
            ..Default::default()
        }
    }

    /// Fixed delay between `max_attempts` attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn linear(max_attempts: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            increment,
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Retry only these error kinds
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on.extend(kinds);
        self
    }

    /// Never retry these error kinds
    pub fn no_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.no_retry_on.extend(kinds);
        self
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential => {
                // cap the exponent so powi cannot overflow to infinity
                let factor = self.multiplier.max(0.0).powi(retry.min(30) as i32);
                let millis = self.initial_delay.as_millis() as f64 * factor;
                let cap = self.max_delay.as_millis() as f64;
                Duration::from_millis(millis.min(cap).max(0.0) as u64)
            }
            BackoffStrategy::Linear => self
                .initial_delay
                .saturating_add(self.increment.saturating_mul(retry)),
            BackoffStrategy::Random => {
                if self.max_delay <= self.initial_delay {
                    self.initial_delay
                } else {
                    let low = self.initial_delay.as_millis() as u64;
                    let high = self.max_delay.as_millis() as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
                }
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether a failed attempt should be retried
    pub fn should_retry(&self, error: &IntegrationError) -> bool {
        let kind = error.kind();
        if matches!(kind, ErrorKind::CircuitOpen | ErrorKind::Cancelled) {
            return false;
        }
        if self.no_retry_on.contains(&kind) {
            return false;
        }
        if !self.retry_on.is_empty() {
            return self.retry_on.contains(&kind);
        }
        error.is_retryable()
    }

    /// Run `operation` until it succeeds, fails permanently or attempts run out
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let policy = RetryPolicy::exponential(5, Duration::from_millis(200), 2.0);
    /// let body = policy.retry(|| client.get("/claims")).await.into_result()?;
    /// ```
    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    return RetryResult {
                        result: Some(value),
                        attempts,
                        total_duration: start.elapsed(),
                        last_error: None,
                    };
                }
                Err(error) => {
                    if attempts < max_attempts && self.should_retry(&error) {
                        let delay = self.delay_for_attempt(attempts - 1);
                        debug!(
                            "Attempt {}/{} failed ({}), retrying in {:?}",
                            attempts, max_attempts, error, delay
                        );
                        counter!("retry.attempts").increment(1);
                        tokio::time::sleep(delay).await;
                    } else {
                        if attempts > 1 {
                            warn!("Giving up after {} attempts: {}", attempts, error);
                            counter!("retry.exhausted").increment(1);
                        }
                        return RetryResult {
                            result: None,
                            attempts,
                            total_duration: start.elapsed(),
                            last_error: Some(error),
                        };
                    }
                }
            }
        }
    }

    /// [`retry`](Self::retry) returning the plain result
    pub async fn retry_result<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry(operation).await.into_result()
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryResult<T> {
    pub result: Option<T>,
    /// Number of calls made, including the first
    pub attempts: u32,
    /// Time spent including delays
    pub total_duration: Duration,
    pub last_error: Option<IntegrationError>,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Get the value or the last error
    pub fn into_result(self) -> Result<T> {
        match self.result {
            Some(value) => Ok(value),
            None => Err(self
                .last_error
                .unwrap_or_else(|| IntegrationError::illegal_state("retry exhausted with no error"))),
        }
    }
}
