//! pipeguard - failure handling for batch ETL pipelines.
//!
//! ## Components
//!
//! - **Checkpoint Store**: durable (scope, key) progress records with
//!   checksum verification, so reruns skip work that is already done
//! - **Retry Executor**: table-driven error classification and bounded,
//!   jittered exponential backoff
//! - **Partial-Failure Collector**: per-item outcomes, one aggregate error
//! - **Circuit Breaker**: fail fast while a dependency is down
//! - **Transaction Manager**: staged, validated, all-or-nothing object
//!   store writes
//!
//! Everything is synchronous. Shared components are `Send + Sync` and are
//! passed around explicitly, usually behind an `Arc`.

pub mod batch;
pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod transaction;

// Re-exports for convenience
pub use batch::{process_batch, BatchOptions, PartialFailureCollector, PartialFailureError};
pub use checkpoint::{
    file_checksum, CheckpointFilter, CheckpointRecord, CheckpointScope, CheckpointStatistics,
    CheckpointStatus, CheckpointStore,
};
pub use models::{
    validate_pipeline_name, Config, ConfigError, Metadata, PipelineError, Result, StorageError,
};
pub use pipeline::{IngestStage, IngestSummary};
pub use retry::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitOpenError, CircuitState, ErrorCategory,
    ErrorClassifier, ErrorKind, RetryExecutor, RetryPolicy,
};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use transaction::{Transaction, TransactionManager, TransactionReport, TransactionState};
