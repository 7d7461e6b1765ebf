//! Sequential batch driver on top of the collector.

use super::collector::PartialFailureCollector;
use std::fmt::Display;
use tracing::{error, info};

/// Options for [`process_batch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Keep processing after a failed item
    pub continue_on_error: bool,
    /// Log progress every `progress_every` items (0 disables)
    pub progress_every: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            progress_every: 10,
        }
    }
}

/// Apply `process` to every item, collecting outcomes.
///
/// Items after the first failure are not visited when `continue_on_error`
/// is false; they do not appear in the collector.
pub fn process_batch<T, E, R, I, F>(
    items: I,
    options: BatchOptions,
    mut process: F,
) -> PartialFailureCollector<T, E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> Result<R, E>,
    T: Display,
    E: Display,
{
    let collector = PartialFailureCollector::new();
    let items = items.into_iter();
    let (hint, _) = items.size_hint();

    for (i, item) in items.enumerate() {
        if options.progress_every > 0 && (i + 1) % options.progress_every == 0 {
            info!(item = i + 1, of = hint, "Processing batch");
        }

        match process(&item) {
            Ok(_) => collector.add_success(item),
            Err(e) => {
                collector.add_failure(item, e);
                if !options.continue_on_error {
                    error!("Stopping batch processing due to error");
                    break;
                }
            }
        }
    }

    collector.log_summary();
    collector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PipelineError;

    fn parse(raw: &&str) -> Result<i64, PipelineError> {
        raw.parse::<i64>()
            .map_err(|e| PipelineError::InvalidInput(format!("{raw}: {e}")))
    }

    #[test]
    fn test_continues_past_failures() {
        let collector = process_batch(["1", "x", "3"], BatchOptions::default(), parse);
        assert_eq!(collector.get_success_count(), 2);
        assert_eq!(collector.get_failure_count(), 1);
    }

    #[test]
    fn test_stop_on_first_error() {
        let options = BatchOptions {
            continue_on_error: false,
            ..Default::default()
        };
        let collector = process_batch(["1", "x", "3", "4"], options, parse);
        assert_eq!(collector.get_total_count(), 2);

        let err = collector.raise_if_failures("Parse failed").unwrap_err();
        assert_eq!(err.failures()[0].0, "x");
    }
}
