//! Per-call-path circuit breakers.
//!
//! One breaker per named dependency path ("s3:put", "s3:copy", ...), created
//! lazily from shared defaults and shared across threads.

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::models::CircuitBreakerConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of circuit breakers keyed by call path.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `path`, created on first use.
    pub fn get(&self, path: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(path) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(path.to_string()).or_insert_with(|| {
            debug!(path = path, "Creating circuit breaker");
            Arc::new(CircuitBreaker::from_config(path, &self.defaults))
        });
        Arc::clone(entry.value())
    }

    /// Register a breaker with non-default settings, replacing any existing one.
    pub fn insert(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.breakers
            .insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Names of breakers that are currently rejecting calls.
    pub fn open_paths(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.name)
            .collect();
        open.sort();
        open
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineError;
    use std::time::Duration;

    #[test]
    fn test_same_path_shares_breaker() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_secs: 60,
        });

        let first = registry.get("s3:put");
        let _ = first.call(|| Err::<(), _>(PipelineError::Transient("503".into())));

        assert_eq!(registry.get("s3:put").state(), CircuitState::Open);
        assert_eq!(registry.get("s3:copy").state(), CircuitState::Closed);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.open_paths(), vec!["s3:put".to_string()]);

        registry.reset_all();
        assert!(registry.open_paths().is_empty());
    }

    #[test]
    fn test_insert_overrides_defaults() {
        let registry = CircuitBreakerRegistry::default();
        registry.insert(CircuitBreaker::new("duckdb", 10, Duration::from_secs(5)));

        let breaker = registry.get("duckdb");
        assert_eq!(breaker.failure_threshold(), 10);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
