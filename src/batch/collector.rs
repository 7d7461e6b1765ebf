//! Partial-failure collection for batch operations.
//!
//! A batch keeps going after an item fails; every outcome is recorded in
//! submission order and the failures are reported together at the end.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Failures shown in summaries and error messages.
const MAX_LISTED_FAILURES: usize = 10;

/// Outcome of one batch item.
#[derive(Debug)]
pub enum BatchOutcome<T, E> {
    Success(T),
    Failure(T, E),
}

impl<T, E> BatchOutcome<T, E> {
    pub fn item(&self) -> &T {
        match self {
            Self::Success(item) | Self::Failure(item, _) => item,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Success(_) => None,
            Self::Failure(_, e) => Some(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Aggregate failure of a batch.
#[derive(Debug)]
pub struct PartialFailureError<T, E> {
    message: String,
    failures: Vec<(T, E)>,
    successes: Vec<T>,
}

impl<T, E> PartialFailureError<T, E> {
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Every failed item with its error, in submission order.
    pub fn failures(&self) -> &[(T, E)] {
        &self.failures
    }

    pub fn successes(&self) -> &[T] {
        &self.successes
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn success_count(&self) -> usize {
        self.successes.len()
    }

    pub fn total_count(&self) -> usize {
        self.failures.len() + self.successes.len()
    }

    pub fn into_parts(self) -> (Vec<(T, E)>, Vec<T>) {
        (self.failures, self.successes)
    }
}

impl<T: fmt::Display, E: fmt::Display> fmt::Display for PartialFailureError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total_count();
        writeln!(f, "{}", self.message)?;
        writeln!(f, "Successes: {}/{}", self.success_count(), total)?;
        writeln!(f, "Failures: {}/{}", self.failure_count(), total)?;
        write!(f, "Failed items:")?;
        for (item, err) in self.failures.iter().take(MAX_LISTED_FAILURES) {
            write!(f, "\n  - {item}: {}", truncate(&err.to_string(), 100))?;
        }
        if self.failures.len() > MAX_LISTED_FAILURES {
            write!(
                f,
                "\n  ... and {} more failures",
                self.failures.len() - MAX_LISTED_FAILURES
            )?;
        }
        Ok(())
    }
}

impl<T, E> std::error::Error for PartialFailureError<T, E>
where
    T: fmt::Debug + fmt::Display,
    E: fmt::Debug + fmt::Display,
{
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

/// Collects per-item outcomes of one batch.
///
/// Safe to share across worker threads; recording never fails.
#[derive(Debug)]
pub struct PartialFailureCollector<T, E> {
    outcomes: Mutex<Vec<BatchOutcome<T, E>>>,
}

impl<T, E> Default for PartialFailureCollector<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> PartialFailureCollector<T, E> {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BatchOutcome<T, E>>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_success(&self, item: T) {
        self.lock().push(BatchOutcome::Success(item));
    }

    pub fn add_failure(&self, item: T, error: E)
    where
        T: fmt::Display,
        E: fmt::Display,
    {
        warn!(item = %item, error = %truncate(&error.to_string(), 200), "Item failed");
        self.lock().push(BatchOutcome::Failure(item, error));
    }

    /// Record the result of processing `item`.
    pub fn record<R>(&self, item: T, result: Result<R, E>)
    where
        T: fmt::Display,
        E: fmt::Display,
    {
        match result {
            Ok(_) => self.add_success(item),
            Err(e) => self.add_failure(item, e),
        }
    }

    pub fn get_success_count(&self) -> usize {
        self.lock().iter().filter(|o| o.is_success()).count()
    }

    pub fn get_failure_count(&self) -> usize {
        self.lock().iter().filter(|o| !o.is_success()).count()
    }

    pub fn get_total_count(&self) -> usize {
        self.lock().len()
    }

    pub fn has_failures(&self) -> bool {
        self.lock().iter().any(|o| !o.is_success())
    }

    pub fn has_successes(&self) -> bool {
        self.lock().iter().any(BatchOutcome::is_success)
    }

    /// Log success/failure counts and the first few failures.
    pub fn log_summary(&self)
    where
        T: fmt::Display,
        E: fmt::Display,
    {
        let outcomes = self.lock();
        let total = outcomes.len();
        if total == 0 {
            info!("No items processed");
            return;
        }

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let failed = total - succeeded;
        info!(
            succeeded,
            total,
            success_rate = %format!("{:.1}%", succeeded as f64 / total as f64 * 100.0),
            "Batch processing summary"
        );

        if failed > 0 {
            warn!(failed, total, "Batch had failed items");
            for outcome in outcomes.iter().filter(|o| !o.is_success()).take(5) {
                if let BatchOutcome::Failure(item, err) = outcome {
                    warn!(item = %item, error = %truncate(&err.to_string(), 100), "Failed item");
                }
            }
        }
    }

    /// Every outcome in submission order.
    pub fn into_outcomes(self) -> Vec<BatchOutcome<T, E>> {
        self.outcomes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Finish the batch: the successful items, or an aggregate error carrying
    /// every failure.
    pub fn raise_if_failures(
        self,
        message: impl Into<String>,
    ) -> Result<Vec<T>, PartialFailureError<T, E>> {
        let mut failures = Vec::new();
        let mut successes = Vec::new();
        for outcome in self.into_outcomes() {
            match outcome {
                BatchOutcome::Success(item) => successes.push(item),
                BatchOutcome::Failure(item, err) => failures.push((item, err)),
            }
        }

        if failures.is_empty() {
            Ok(successes)
        } else {
            Err(PartialFailureError {
                message: message.into(),
                failures,
                successes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineError;
    use std::sync::Arc;
    use std::thread;

    fn process(item: &str) -> Result<(), PipelineError> {
        if item == "B" {
            Err(PipelineError::InvalidInput("malformed row 12".into()))
        } else {
            Ok(())
        }
    }

    #[test]
    fn test_partial_failure_isolates_items() {
        let collector = PartialFailureCollector::new();
        for item in ["A", "B", "C"] {
            collector.record(item.to_string(), process(item));
        }

        assert_eq!(collector.get_success_count(), 2);
        assert_eq!(collector.get_failure_count(), 1);
        assert_eq!(collector.get_total_count(), 3);
        assert!(collector.has_failures());
        collector.log_summary();

        let err = collector.raise_if_failures("Upload batch failed").unwrap_err();
        assert_eq!(err.failures().len(), 1);
        let (item, error) = &err.failures()[0];
        assert_eq!(item, "B");
        assert!(matches!(error, PipelineError::InvalidInput(_)));
        assert_eq!(err.successes(), &["A".to_string(), "C".to_string()]);

        let msg = err.to_string();
        assert!(msg.starts_with("Upload batch failed"));
        assert!(msg.contains("Successes: 2/3"));
        assert!(msg.contains("  - B: Invalid input: malformed row 12"));
    }

    #[test]
    fn test_no_failures_returns_successes() {
        let collector: PartialFailureCollector<u32, PipelineError> =
            PartialFailureCollector::new();
        collector.add_success(1);
        collector.add_success(2);
        assert!(!collector.has_failures());
        assert_eq!(collector.raise_if_failures("unused").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_outcomes_keep_submission_order() {
        let collector = PartialFailureCollector::new();
        collector.add_failure(1, PipelineError::Transient("x".into()));
        collector.add_success(2);
        collector.add_failure(3, PipelineError::Transient("y".into()));

        let items: Vec<_> = collector
            .into_outcomes()
            .iter()
            .map(|o| (*o.item(), o.error().is_some()))
            .collect();
        assert_eq!(items, vec![(1, true), (2, false), (3, true)]);
    }

    #[test]
    fn test_display_truncates_long_failure_lists() {
        let collector = PartialFailureCollector::new();
        for i in 0..12 {
            collector.add_failure(i, PipelineError::Transient(format!("err {i}")));
        }
        let msg = collector.raise_if_failures("Many failed").unwrap_err().to_string();
        assert!(msg.contains("... and 2 more failures"));
        assert!(!msg.contains("  - 11:"));
    }

    #[test]
    fn test_concurrent_recording() {
        let collector = Arc::new(PartialFailureCollector::<usize, PipelineError>::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for i in 0..25 {
                        let item = t * 25 + i;
                        if item % 10 == 0 {
                            collector.add_failure(item, PipelineError::Transient("503".into()));
                        } else {
                            collector.add_success(item);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(collector.get_total_count(), 100);
        assert_eq!(collector.get_failure_count(), 10);
    }
}
