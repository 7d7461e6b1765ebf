//! Checkpointing for resumable pipeline stages.
//!
//! Provides:
//! - `CheckpointStore`: durable (scope, key) status records in SQLite
//! - `CheckpointRecord`: one unit of work and its progress
//! - `file_checksum`: content hash used to detect changed source files

mod checksum;
mod record;
mod store;

pub use checksum::*;
pub use record::*;
pub use store::*;
