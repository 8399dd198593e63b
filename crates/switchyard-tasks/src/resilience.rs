//! Retry with capped exponential backoff, wrapped in a circuit breaker.
//!
//! The breaker is an explicit `closed -> open -> half-open` state machine
//! driven by an injectable [`Clock`], so cooldown behaviour can be tested
//! without sleeping.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use switchyard_core::config::{BreakerConfig, RetryConfig};
use switchyard_core::{InfrastructureError, ProvisioningError};

/// Source of the current instant
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's timer, so paused test runtimes control it
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one dependency class
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(
        dependency: impl Into<String>,
        threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            threshold: threshold.max(1),
            cooldown,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Create a breaker from configuration
    pub fn from_config(
        dependency: impl Into<String>,
        config: &BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            dependency,
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
            clock,
        )
    }

    /// Name of the guarded dependency
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, after applying any elapsed cooldown
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let cooled = inner
                .opened_at
                .map_or(true, |at| self.clock.now().duration_since(at) >= self.cooldown);
            if cooled {
                debug!(dependency = %self.dependency, "breaker half-open");
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = false;
            }
        }
    }

    /// `None` rejects the call, `Some(true)` admits it as the half-open trial
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => None,
            BreakerState::HalfOpen if inner.trial_in_flight => None,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(true)
            }
        }
    }

    /// Ask permission for one call; `false` means fail fast. The caller must
    /// record the outcome right away.
    pub fn try_acquire(&self) -> bool {
        self.admit().is_some()
    }

    /// Ask permission for a call that may be abandoned before it finishes.
    /// Dropping the permit without judging it frees the trial slot.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        self.admit().map(|trial| BreakerPermit {
            breaker: self,
            trial,
            judged: false,
        })
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            debug!(dependency = %self.dependency, "breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call. Returns the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.threshold;
        if trip && inner.state != BreakerState::Open {
            warn!(
                dependency = %self.dependency,
                failures = inner.consecutive_failures,
                "breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(self.clock.now());
        }
        inner.trial_in_flight = false;
        inner.consecutive_failures
    }

    /// Release a half-open trial slot without judging the dependency
    pub fn record_neutral(&self) {
        self.lock().trial_in_flight = false;
    }
}

/// Permission for one call, see [`CircuitBreaker::acquire`]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    judged: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.judged = true;
        self.breaker.record_success();
    }

    /// Returns the consecutive failure count
    pub fn failure(mut self) -> u32 {
        self.judged = true;
        self.breaker.record_failure()
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.judged {
            self.breaker.record_neutral();
        }
    }
}

/// Backoff schedule for retryable failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Errors the resilience layer knows how to classify
pub trait Retryable {
    /// A fresh attempt may succeed
    fn is_retryable(&self) -> bool;

    /// The failure says something about the dependency's health
    fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }
}

impl Retryable for InfrastructureError {
    fn is_retryable(&self) -> bool {
        InfrastructureError::is_retryable(self)
    }

    fn counts_against_breaker(&self) -> bool {
        true
    }
}

impl Retryable for ProvisioningError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProvisioningError::Backend { .. })
    }
}

/// Why a guarded call gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError<E: fmt::Display> {
    /// The breaker refused the call
    #[error("circuit breaker open for {dependency}")]
    BreakerOpen { dependency: String },

    /// Every attempt failed with a retryable error
    #[error("infrastructure error, retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-retryable error ended the call
    #[error("{0}")]
    Fatal(E),
}

/// A successful guarded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Retry policy plus the breaker for one dependency class
#[derive(Debug, Clone)]
pub struct Resilience {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the breaker, retrying retryable failures with backoff.
    ///
    /// `on_retry` is told the failed attempt number, its error and the delay
    /// before the next attempt.
    pub async fn call<T, E, F, Fut>(
        &self,
        mut op: F,
        mut on_retry: impl FnMut(u32, &E, Duration),
    ) -> Result<Attempted<T>, ResilienceError<E>>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let Some(permit) = self.breaker.acquire() else {
                return Err(ResilienceError::BreakerOpen {
                    dependency: self.breaker.dependency().to_string(),
                });
            };

            // If this future is dropped mid-call the permit releases the slot
            match op(attempt).await {
                Ok(value) => {
                    permit.success();
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    if err.counts_against_breaker() {
                        permit.failure();
                    } else {
                        drop(permit);
                    }

                    if !err.is_retryable() {
                        return Err(ResilienceError::Fatal(err));
                    }
                    if attempt >= max_attempts {
                        return Err(ResilienceError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        dependency = %self.breaker.dependency(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    on_retry(attempt, &err, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
