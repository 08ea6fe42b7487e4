//! Connection resilience
//!
//! - **Retry**: [`Resilience::execute_with_retry`] retries connection-class failures
//!   with a fixed delay, up to [`RetryPolicy::max_retries`] times. Any other failure
//!   surfaces on the first attempt.
//! - **Circuit breaker**: optional; while open, calls fail fast with a non-retryable
//!   `CircuitOpen` error instead of waiting on a dead broker. The breaker is consulted
//!   once per call and counts failed calls, not attempts, so retries inside one call
//!   never trip it.
//!
//! ## Circuit Breaker States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ open_duration elapsed
//!      │                                   v
//!      │      success            ┌─────────────┐
//!      └──────────────────────── │ HALF-OPEN   │  one trial call at a time
//!                                └─────────────┘
//!                                      │
//!                       failure        │ back to OPEN
//!                       ───────────────┘
//! ```
//!
//! Only connection-class failures count against the breaker. A server that answers
//! with an error is up.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, RetryPolicy};
use crate::error::ClientError;
use crate::metrics::RelayMetrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    trial_in_flight: AtomicBool,
}

/// Admission through the breaker. A half-open trial slot is freed on drop.
pub struct BreakerPermit<'a> {
    trial: Option<&'a AtomicBool>,
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let Some(trial) = self.trial {
            trial.store(false, Ordering::SeqCst);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call, or `None` while the circuit refuses calls.
    ///
    /// Moves Open → HalfOpen once the open period ends. In HalfOpen only one trial
    /// call is admitted until its permit is dropped.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        match self.state() {
            CircuitState::Closed => Some(BreakerPermit { trial: None }),
            CircuitState::HalfOpen => self.try_trial(),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if !elapsed {
                    return None;
                }
                self.transition(CircuitState::HalfOpen);
                self.try_trial()
            }
        }
    }

    fn try_trial(&self) -> Option<BreakerPermit<'_>> {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BreakerPermit {
                trial: Some(&self.trial_in_flight),
            })
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => self.failure_count.store(0, Ordering::SeqCst),
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => self.transition(CircuitState::Closed),
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, next: CircuitState) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return;
            }
            *state = next;
        }

        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap_or_else(PoisonError::into_inner) =
            (next == CircuitState::Open).then(Instant::now);

        RelayMetrics::circuit_transition(&self.name, next.as_str());
        match next {
            CircuitState::Open => warn!(
                name = %self.name,
                open_for = ?self.config.open_duration,
                "Circuit breaker opened"
            ),
            _ => info!(name = %self.name, state = next.as_str(), "Circuit breaker state changed"),
        }
    }
}

/// Retry wrapper around broker and store calls.
#[derive(Clone)]
pub struct Resilience {
    name: String,
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Resilience {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            breaker: None,
        }
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(Arc::new(CircuitBreaker::new(self.name.clone(), config)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(|b| b.state())
    }

    /// Run `op`, retrying connection-class failures.
    ///
    /// `op` is invoked at most `max_retries + 1` times. Non-retryable errors and an
    /// open circuit return immediately. The breaker sees one outcome per call.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let _permit = match &self.breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => return Err(ClientError::circuit_open(&self.name)),
            },
            None => None,
        };

        let mut retries = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                // the server answered, so the connection is fine
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                return Err(err);
            }

            if retries >= self.policy.max_retries {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
                warn!(
                    component = %self.name,
                    operation = %operation,
                    attempts = retries + 1,
                    error = %err,
                    "Giving up after connection failures"
                );
                return Err(err);
            }

            retries += 1;
            RelayMetrics::retry(&self.name, operation);
            warn!(
                component = %self.name,
                operation = %operation,
                retry = retries,
                max_retries = self.policy.max_retries,
                delay_ms = self.policy.retry_interval.as_millis() as u64,
                error = %err,
                "Connection failure, retrying"
            );
            tokio::time::sleep(self.policy.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100))
    }

    /// Fails with `error` for the first `failures` calls, then succeeds
    async fn flaky(
        calls: &AtomicUsize,
        failures: usize,
        error: ClientError,
    ) -> Result<&'static str, ClientError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures { Err(error) } else { Ok("ok") }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connection_errors_until_success() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", policy(3));

        let result = resilience
            .execute_with_retry("publish", || {
                flaky(&calls, 2, ClientError::connection("refused"))
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", policy(3));
        let started = Instant::now();

        let err = resilience
            .execute_with_retry("publish", || {
                flaky(&calls, usize::MAX, ClientError::timeout("slow"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ClientErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", policy(3));

        let err = resilience
            .execute_with_retry("publish", || {
                flaky(&calls, usize::MAX, ClientError::rejected("WRONGTYPE"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ClientErrorKind::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_fails_fast() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", RetryPolicy::none()).with_circuit_breaker(
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_duration: Duration::from_secs(30),
            },
        );

        for _ in 0..2 {
            let _ = resilience
                .execute_with_retry("publish", || {
                    flaky(&calls, usize::MAX, ClientError::connection("down"))
                })
                .await;
        }
        assert_eq!(resilience.circuit_state(), Some(CircuitState::Open));

        let err = resilience
            .execute_with_retry("publish", || flaky(&calls, 0, ClientError::connection("")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ClientErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // After the open period a trial call closes the circuit again
        tokio::time::advance(Duration::from_secs(30)).await;
        let ok = resilience
            .execute_with_retry("publish", || flaky(&calls, 0, ClientError::connection("")))
            .await;
        assert_eq!(ok.unwrap(), "ok");
        assert_eq!(resilience.circuit_state(), Some(CircuitState::Closed));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "store",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                open_duration: Duration::ZERO,
            },
        );

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let trial = breaker.try_acquire();
        assert!(trial.is_some());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::new(
            "broker",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                open_duration: Duration::ZERO,
            },
        );
        breaker.record_failure();

        let trial = breaker.try_acquire().expect("first trial admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_none());

        breaker.record_success();
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.try_acquire().expect("slot freed by the finished trial");
        breaker.record_success();
        drop(second);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_some());
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_within_one_call_do_not_open_the_circuit() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", RetryPolicy::new(10, Duration::from_millis(10)))
            .with_circuit_breaker(CircuitBreakerConfig::default());

        let result = resilience
            .execute_with_retry("publish", || {
                flaky(&calls, 7, ClientError::connection("refused"))
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(resilience.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_calls_count_once_each() {
        let calls = AtomicUsize::new(0);
        let resilience = Resilience::new("broker", RetryPolicy::new(3, Duration::from_millis(10)))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_duration: Duration::from_secs(30),
            });

        let _ = resilience
            .execute_with_retry("publish", || flaky(&calls, usize::MAX, ClientError::connection("down")))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(resilience.circuit_state(), Some(CircuitState::Closed));

        let _ = resilience
            .execute_with_retry("publish", || flaky(&calls, usize::MAX, ClientError::connection("down")))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(resilience.circuit_state(), Some(CircuitState::Open));
    }
}
