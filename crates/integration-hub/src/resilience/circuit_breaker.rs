//! Circuit breaker for calls to external systems
//!
//! # States
//!
//! - **Closed**: calls pass through; failures are counted
//! - **Open**: calls fail immediately until `reset_timeout` has elapsed
//! - **Half-Open**: one trial call at a time decides between Closed and Open
//!
//! ```text
//!            consecutive failures >= threshold
//!            or window failure rate >= threshold
//!   Closed ─────────────────────────────────────▶ Open
//!     ▲                                         │   ▲
//!     │ success_threshold trials succeed        │   │ trial fails
//!     │                        reset_timeout    ▼   │
//!     └──────────────────────────────────── Half-Open
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("partner-sftp")
//!     .with_failure_threshold(3)
//!     .with_reset_timeout(Duration::from_secs(30));
//!
//! let listing = breaker.call(|| client.list_files("/outbox", None)).await;
//! ```

use crate::error::IntegrationError;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u64,
    /// Time spent open before a trial is allowed
    pub reset_timeout: Duration,
    /// Successful trials needed to close from half-open
    pub success_threshold: u64,
    /// Number of recent calls kept for the failure rate
    pub sliding_window_size: usize,
    /// Failure percentage over a full window that opens the circuit
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            sliding_window_size: 10,
            failure_rate_threshold: 50.0,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    /// Failure percentage over the current window
    pub failure_rate: f64,
}

/// Circuit breaker for protecting against cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
    trial_in_flight: AtomicBool,
    window: Mutex<VecDeque<bool>>,
    last_state_change: RwLock<Instant>,
}

/// Clears the half-open trial slot when the trial ends, even if its future is dropped
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker with custom configuration
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            window: Mutex::new(VecDeque::with_capacity(config.sliding_window_size)),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            last_state_change: RwLock::new(Instant::now()),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold.max(1);
        self
    }

    pub fn with_sliding_window(mut self, size: usize, failure_rate_threshold: f64) -> Self {
        self.config.sliding_window_size = size;
        self.config.failure_rate_threshold = failure_rate_threshold;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Consecutive failures while closed
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Check if a call would currently be let through
    pub fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.last_state_change.read().elapsed() >= self.config.reset_timeout,
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::SeqCst),
        }
    }

    fn acquire(&self) -> Option<TrialPermit<'_>> {
        if self.state() == CircuitState::Open {
            if self.last_state_change.read().elapsed() < self.config.reset_timeout {
                return None;
            }
            self.transition_to(CircuitState::HalfOpen);
        }
        match self.state() {
            CircuitState::Closed => Some(TrialPermit {
                breaker: self,
                trial: false,
            }),
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .ok()
                .map(|_| TrialPermit {
                    breaker: self,
                    trial: true,
                }),
            CircuitState::Open => None,
        }
    }

    /// Execute a function through the circuit breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(_permit) = self.acquire() else {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            counter!("circuit_breaker.rejected").increment(1);
            return Err(CircuitBreakerError::Open(self.name.clone()));
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Execute through the breaker, answering with `fallback` when the call is
    /// rejected or fails
    pub async fn call_with_fallback<F, Fut, T, E, FB>(&self, f: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitBreakerError<E>) -> T,
    {
        match self.call(f).await {
            Ok(value) => value,
            Err(e) => fallback(e),
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
                self.push_outcome(true);
            }
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                let consecutive = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                let rate_exceeded = self.push_outcome(false);
                if consecutive >= self.config.failure_threshold || rate_exceeded {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // any trial failure reopens and restarts the clock
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Append to the sliding window; true when a full window is at or above the rate threshold
    fn push_outcome(&self, success: bool) -> bool {
        let size = self.config.sliding_window_size;
        if size == 0 {
            return false;
        }
        let mut window = self.window.lock();
        if window.len() == size {
            window.pop_front();
        }
        window.push_back(success);
        window.len() == size && failure_rate(&window) >= self.config.failure_rate_threshold
    }

    /// Manually close the breaker
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
    }

    /// Manually open the breaker
    pub fn trip(&self) {
        self.transition_to(CircuitState::Open);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.failure_count(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            failure_rate: failure_rate(&self.window.lock()),
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old_state: CircuitState = self.state.swap(new_state as u8, Ordering::SeqCst).into();
        if old_state == new_state {
            if new_state == CircuitState::Open {
                *self.last_state_change.write() = Instant::now();
            }
            return;
        }

        *self.last_state_change.write() = Instant::now();
        self.success_count.store(0, Ordering::SeqCst);
        match new_state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
                self.window.lock().clear();
                info!("Circuit breaker '{}' closed", self.name);
            }
            CircuitState::Open => {
                warn!(
                    "Circuit breaker '{}' opened (was {:?}), rejecting calls for {:?}",
                    self.name, old_state, self.config.reset_timeout
                );
                counter!("circuit_breaker.opened").increment(1);
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker '{}' half-open, allowing a trial call", self.name);
            }
        }
    }
}

fn failure_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|ok| !**ok).count();
    failures as f64 * 100.0 / window.len() as f64
}

/// Error returned by circuit breaker
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The named circuit is open, the call was not made
    Open(String),
    /// The underlying operation failed
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open(name) => write!(f, "circuit breaker '{}' is open", name),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::Open(_) => None,
            CircuitBreakerError::Inner(e) => Some(e),
        }
    }
}

impl From<CircuitBreakerError<IntegrationError>> for IntegrationError {
    fn from(e: CircuitBreakerError<IntegrationError>) -> Self {
        match e {
            CircuitBreakerError::Open(name) => IntegrationError::CircuitOpen(name),
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

/// Named breakers shared across components
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose lazily created breakers use `config`
    pub fn with_default_config(config: CircuitBreakerConfig) -> Self {
        Self {
            default_config: config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the named breaker, creating it with the default config
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the named breaker, creating it with `config` if absent
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_config(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.read().values().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async { Err::<(), _>(IntegrationError::connection("down")) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, CircuitBreakerError<IntegrationError>> {
        breaker.call(|| async { Ok::<_, IntegrationError>(1) }).await
    }

    #[test]
    fn test_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.sliding_window_size, 10);
        assert_eq!(config.failure_rate_threshold, 50.0);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let breaker = CircuitBreaker::new("svc")
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_millis(20))
            .with_success_threshold(1);

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(CircuitBreakerError::Open(_))));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("svc")
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(20));
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed());
    }

    #[tokio::test]
    async fn test_success_threshold_needs_several_trials() {
        let breaker = CircuitBreaker::new("svc")
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(10))
            .with_success_threshold(2);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_trial_in_half_open() {
        let breaker = CircuitBreaker::new("svc").with_reset_timeout(Duration::ZERO);
        breaker.trip();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.call(|| async move {
            let _ = rx.await;
            Ok::<_, IntegrationError>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let rejected = matches!(succeed(&breaker).await, Err(CircuitBreakerError::Open(_)));
            let _ = tx.send(());
            rejected
        };
        let (first, rejected) = tokio::join!(trial, second);
        assert!(first.is_ok());
        assert!(rejected);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_rate_opens_with_full_window() {
        let breaker = CircuitBreaker::new("svc")
            .with_failure_threshold(100)
            .with_sliding_window(4, 50.0);
        let _ = succeed(&breaker).await;
        fail(&breaker).await;
        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_fallback_and_error_conversion() {
        let breaker = CircuitBreaker::new("svc");
        breaker.trip();
        let value = breaker
            .call_with_fallback(|| async { Ok::<_, IntegrationError>(1) }, |_| -1)
            .await;
        assert_eq!(value, -1);

        let err: IntegrationError = succeed(&breaker).await.unwrap_err().into();
        assert!(matches!(err, IntegrationError::CircuitOpen(ref name) if name == "svc"));
        assert_eq!(breaker.metrics().total_rejected, 2);
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("rest");
        let b = registry.get_or_create("rest");
        assert!(Arc::ptr_eq(&a, &b));
        a.trip();
        assert_eq!(b.state(), CircuitState::Open);
        registry.reset_all();
        assert_eq!(a.state(), CircuitState::Closed);
        assert_eq!(registry.names(), vec!["rest"]);
    }
}
