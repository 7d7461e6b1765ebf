//! Failure classification, retries and circuit breaking.
//!
//! Provides:
//! - `ErrorClassifier`: kind → transient/permanent/unknown lookup table
//! - `RetryExecutor`: bounded exponential backoff with jitter
//! - `CircuitBreaker`: fail-fast guard for a failing dependency
//! - `CircuitBreakerRegistry`: one breaker per protected call path

mod circuit_breaker;
mod classifier;
mod executor;
mod registry;

pub use circuit_breaker::*;
pub use classifier::*;
pub use executor::*;
pub use registry::*;
