//! Circuit breaker for a failing dependency.
//!
//! CLOSED counts consecutive failures; at the threshold the circuit OPENs and
//! rejects calls without running them. After the cool-down one HALF_OPEN trial
//! is admitted: success closes the circuit, failure re-opens it.

use crate::models::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Failure threshold exceeded, calls are rejected
    Open,
    /// Cool-down elapsed, one trial call allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Call rejected because the circuit is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Circuit breaker '{name}' is open after {failure_count} failures; retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub failure_count: u32,
    /// Remaining cool-down (zero while a half-open trial is in flight)
    pub retry_in: Duration,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one call path.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker; a threshold of 0 is treated as 1.
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.timeout())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An open circuit whose cool-down has elapsed reports
    /// `HalfOpen`: the next call will be a trial.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        self.effective_state(&inner, Instant::now())
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.effective_state(&inner, Instant::now()),
            failure_count: inner.failure_count,
            last_failure: inner.last_failure,
        }
    }

    fn effective_state(&self, inner: &Inner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Open if self.cooldown_elapsed(inner, now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn cooldown_elapsed(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .last_failure
            .map_or(true, |t| now.duration_since(t) >= self.timeout)
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejections never invoke the operation. The lock is not held while the
    /// operation runs. A panicking operation counts as a failure.
    pub fn call<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CircuitOpenError>,
    {
        self.admit().map_err(E::from)?;

        let mut guard = PanicGuard {
            breaker: self,
            armed: true,
        };
        let result = operation();
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<(), CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open if self.cooldown_elapsed(&inner, now) => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
                Ok(())
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(())
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                let retry_in = inner
                    .last_failure
                    .map(|t| self.timeout.saturating_sub(now.duration_since(t)))
                    .unwrap_or_default();
                Err(CircuitOpenError {
                    name: self.name.clone(),
                    failure_count: inner.failure_count,
                    retry_in: if inner.state == CircuitState::HalfOpen {
                        Duration::ZERO
                    } else {
                        retry_in
                    },
                })
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Trial call failed, circuit breaker re-opened"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                error!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Force the circuit closed with zero failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

/// Records a failure if the guarded operation unwinds.
struct PanicGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(breaker = %self.breaker.name, "Operation panicked, counting as failure");
            self.breaker.on_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineError;
    use std::cell::Cell;
    use std::thread;

    fn failing() -> Result<(), PipelineError> {
        Err(PipelineError::Transient("storage outage".into()))
    }

    #[test]
    fn test_opens_and_recovers() {
        let breaker = CircuitBreaker::new("s3", 3, Duration::from_secs(1));
        let calls = Cell::new(0);

        for _ in 0..3 {
            let result: Result<(), PipelineError> = breaker.call(|| {
                calls.set(calls.get() + 1);
                failing()
            });
            assert!(matches!(result, Err(PipelineError::Transient(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.get(), 3);

        let rejected: Result<(), PipelineError> = breaker.call(|| {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert!(matches!(rejected, Err(PipelineError::CircuitOpen(_))));
        assert_eq!(calls.get(), 3, "open circuit must not invoke the operation");

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial: Result<u32, PipelineError> = breaker.call(|| {
            calls.set(calls.get() + 1);
            Ok(7)
        });
        assert_eq!(trial.unwrap(), 7);
        assert_eq!(calls.get(), 4);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_panicking_trial_reopens() {
        let breaker = CircuitBreaker::new("s3", 1, Duration::from_millis(200));
        let _ = breaker.call(failing);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), PipelineError> = breaker.call(|| panic!("driver bug"));
        }));
        assert!(panicked.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 2);

        // The next trial is admitted after the cool-down
        thread::sleep(Duration::from_millis(250));
        let trial: Result<(), PipelineError> = breaker.call(|| Ok(()));
        assert!(trial.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("s3", 1, Duration::from_millis(50));
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);

        thread::sleep(Duration::from_millis(80));
        let _ = breaker.call(failing);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 2);
        let rejected = breaker.call(|| Ok::<_, PipelineError>(()));
        assert!(matches!(rejected, Err(PipelineError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("db", 3, Duration::from_secs(60));
        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        assert_eq!(breaker.failure_count(), 2);

        breaker.call(|| Ok::<_, PipelineError>(())).unwrap();
        assert_eq!(breaker.failure_count(), 0);

        let _ = breaker.call(failing);
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_manual_reset() {
        let breaker = CircuitBreaker::new("db", 1, Duration::from_secs(60));
        let _ = breaker.call(failing);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.call(|| Ok::<_, PipelineError>(())).is_ok());
    }

    #[test]
    fn test_open_error_reports_remaining_cooldown() {
        let breaker = CircuitBreaker::new("api", 1, Duration::from_secs(30));
        let _ = breaker.call(failing);

        match breaker.call(|| Ok::<_, PipelineError>(())) {
            Err(PipelineError::CircuitOpen(e)) => {
                assert_eq!(e.name, "api");
                assert_eq!(e.failure_count, 1);
                assert!(e.retry_in > Duration::from_secs(25));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }
}
