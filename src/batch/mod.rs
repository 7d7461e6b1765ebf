//! Batch processing with partial-failure reporting.
//!
//! Provides:
//! - `PartialFailureCollector`: per-item outcomes, one aggregate error at the end
//! - `process_batch`: sequential driver that feeds a collector

mod collector;
mod process;

pub use collector::*;
pub use process::*;
