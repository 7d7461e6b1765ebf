//! Retry executor with exponential backoff and jitter.
//!
//! Blocking by design: the calling thread sleeps between attempts.

use super::circuit_breaker::{CircuitBreaker, CircuitOpenError};
use super::classifier::{Classify, ErrorCategory, ErrorClassifier};
use crate::models::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Growth factor between attempts
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    /// Scale each delay by a random factor in [0.5, 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

impl RetryPolicy {
    /// Policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_secs: 0.0,
            max_delay_secs: 0.0,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.initial_delay_secs >= 0.0 && self.max_delay_secs >= self.initial_delay_secs) {
            return Err(ConfigError::Invalid(
                "retry delays must satisfy 0 <= initial_delay_secs <= max_delay_secs".to_string(),
            ));
        }
        if self.max_delay_secs > MAX_BACKOFF.as_secs_f64() {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_secs must not exceed {}",
                MAX_BACKOFF.as_secs()
            )));
        }
        if !(self.exponential_base >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.exponential_base must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before the attempt following `attempt` (1-indexed), without jitter:
    /// `min(initial * base^(attempt-1), max)`, never above [`MAX_BACKOFF`].
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = (self.initial_delay_secs * self.exponential_base.powi(exponent))
            .min(self.max_delay_secs)
            .max(0.0);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Backoff with jitter applied when enabled.
    pub fn sleep_duration(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Executes fallible operations with classification-aware retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: Arc::new(ErrorClassifier::default()),
        }
    }

    /// Use a custom classification table.
    pub fn with_classifier(mut self, classifier: Arc<ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. The last error is returned unchanged.
    pub fn execute<T, E, F>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let category = self.classifier.classify(&err);

            if category == ErrorCategory::Permanent {
                error!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "Permanent error, not retrying"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(
                    operation = operation_name,
                    attempts = max_attempts,
                    category = %category,
                    error = %err,
                    "All attempts failed"
                );
                return Err(err);
            }

            let delay = self.policy.sleep_duration(attempt);
            warn!(
                operation = operation_name,
                attempt,
                max_attempts,
                category = %category,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    /// Like [`execute`](Self::execute), with every attempt routed through a
    /// circuit breaker. An open circuit stops the retry loop.
    pub fn execute_guarded<T, E, F>(
        &self,
        operation_name: &str,
        breaker: &CircuitBreaker,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + Display + From<CircuitOpenError>,
    {
        self.execute(operation_name, || breaker.call(&mut operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineError, StorageError};
    use crate::retry::CircuitState;
    use std::cell::Cell;

    #[test]
    fn test_retry_exhaustion_returns_original_error() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(3));
        let calls = Cell::new(0);

        let result: Result<(), PipelineError> = executor.execute("upload", || {
            calls.set(calls.get() + 1);
            Err(StorageError::Throttled("SlowDown".into()).into())
        });

        assert_eq!(calls.get(), 3);
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(StorageError::Throttled(_))));
        assert_eq!(err.to_string(), "Storage error: Request throttled: SlowDown");
    }

    #[test]
    fn test_permanent_error_short_circuits() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let calls = Cell::new(0);

        let result: Result<(), PipelineError> = executor.execute("upload", || {
            calls.set(calls.get() + 1);
            Err(StorageError::AccessDenied("bucket".into()).into())
        });

        assert_eq!(calls.get(), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_errors_are_retried_until_success() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(4));
        let calls = Cell::new(0);

        let result = executor.execute("flaky", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(PipelineError::Internal("unclassified".into()))
            } else {
                Ok("done")
            }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_custom_classifier_makes_not_found_retryable() {
        let classifier = ErrorClassifier::new().with_rule(
            crate::retry::ErrorKind::NotFound,
            ErrorCategory::Transient,
        );
        let executor =
            RetryExecutor::new(RetryPolicy::immediate(2)).with_classifier(Arc::new(classifier));
        let calls = Cell::new(0);

        let _: Result<(), PipelineError> = executor.execute("head", || {
            calls.set(calls.get() + 1);
            Err(PipelineError::NotFound("key".into()))
        });
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_secs: 1.0,
            max_delay_secs: 5.0,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_delays_are_rejected_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_secs: 1e20,
            max_delay_secs: 1e20,
            exponential_base: 2.0,
            jitter: true,
        };
        assert!(policy.validate().is_err());
        assert_eq!(policy.backoff_delay(1), MAX_BACKOFF);
        assert!(policy.sleep_duration(2) <= MAX_BACKOFF);

        let unbounded = RetryPolicy {
            max_delay_secs: f64::INFINITY,
            ..policy
        };
        assert_eq!(unbounded.backoff_delay(1), MAX_BACKOFF);
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_secs: 2.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let d = policy.sleep_duration(2);
            assert!(d >= Duration::from_secs(2) && d < Duration::from_secs(4));
        }
    }

    #[test]
    fn test_real_sleep_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_secs: 0.05,
            max_delay_secs: 1.0,
            exponential_base: 2.0,
            jitter: false,
        };
        let executor = RetryExecutor::new(policy);
        let start = std::time::Instant::now();

        let _: Result<(), PipelineError> =
            executor.execute("slow", || Err(PipelineError::Transient("timeout".into())));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_guarded_execution_stops_when_circuit_opens() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let breaker = CircuitBreaker::new("s3", 2, Duration::from_secs(60));
        let calls = Cell::new(0);

        let result: Result<(), PipelineError> = executor.execute_guarded("put", &breaker, || {
            calls.set(calls.get() + 1);
            Err(PipelineError::Transient("503".into()))
        });

        assert_eq!(calls.get(), 2);
        assert!(matches!(result, Err(PipelineError::CircuitOpen(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
