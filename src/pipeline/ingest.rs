//! Ingestion stage: source files to the landing zone.
//!
//! Per file:
//! 1. Skip if the FILE checkpoint is COMPLETED and the checksum still matches
//! 2. Mark IN_PROGRESS, run the caller's processing inside a transaction
//! 3. Mark COMPLETED or FAILED and record the outcome
//!
//! One bad file never stops its siblings; the failures come back together
//! at the end. Only an open object store circuit stops the run early.

use crate::batch::{PartialFailureCollector, PartialFailureError};
use crate::checkpoint::{CheckpointScope, CheckpointStore};
use crate::models::{Config, Metadata, PipelineError, Result};
use crate::retry::{CircuitBreaker, RetryExecutor};
use crate::storage::ObjectStore;
use crate::transaction::{Transaction, TransactionManager};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// A source file, displayed as its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile(pub PathBuf);

impl SourceFile {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Counts for a fully successful ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub processed: usize,
    pub skipped: usize,
}

/// Failure report of an ingest run.
pub type IngestError = PartialFailureError<SourceFile, PipelineError>;

/// Checkpointed, transactional ingestion of source files.
pub struct IngestStage {
    checkpoints: Arc<CheckpointStore>,
    transactions: TransactionManager,
}

impl IngestStage {
    pub fn new(checkpoints: Arc<CheckpointStore>, transactions: TransactionManager) -> Self {
        Self {
            checkpoints,
            transactions,
        }
    }

    /// Wire a stage from configuration.
    ///
    /// Opens the pipeline's checkpoint store and guards object store calls
    /// with a circuit breaker built from `[circuit_breaker]`.
    pub fn from_config(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let checkpoints = Arc::new(CheckpointStore::open(
            &config.pipeline.name,
            &config.checkpoint_dir(),
        )?);
        let transactions = TransactionManager::new(store, config.transaction.clone())
            .with_checkpoints(Arc::clone(&checkpoints))
            .with_retry(RetryExecutor::new(config.retry.clone()));
        let breaker = CircuitBreaker::from_config("object_store", &config.circuit_breaker);

        Ok(Self::new(checkpoints, transactions).with_breaker(Arc::new(breaker)))
    }

    /// Guard object store calls with `breaker` and stop the run once it
    /// opens. Errors from `process` itself never trip it.
    pub fn with_breaker(self, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            transactions: self.transactions.with_breaker(breaker),
            ..self
        }
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Ingest `files`, calling `process` for each one that is not done yet.
    ///
    /// `process` stages the file's outputs on the transaction it is given;
    /// the transaction commits when it returns `Ok`.
    pub fn ingest<I, F>(
        &self,
        files: I,
        mut process: F,
    ) -> std::result::Result<IngestSummary, IngestError>
    where
        I: IntoIterator<Item = PathBuf>,
        F: FnMut(&Path, &mut Transaction) -> Result<()>,
    {
        let start = Instant::now();
        let files: Vec<SourceFile> = files.into_iter().map(SourceFile).collect();
        let total = files.len();
        let collector = PartialFailureCollector::new();
        let mut summary = IngestSummary::default();

        info!(total, pipeline = self.checkpoints.pipeline_name(), "Starting ingest");

        let mut remaining = files.into_iter();
        while let Some(file) = remaining.next() {
            let key = file.to_string();
            let path = file.path().to_path_buf();

            match self.checkpoints.is_completed(CheckpointScope::File, &key, Some(&path), true) {
                Ok(true) => {
                    info!(file = %key, "Already ingested, skipping");
                    summary.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    collector.add_failure(file, e);
                    continue;
                }
            }

            let metadata = Metadata::from([("stage".to_string(), "ingest".to_string())]);
            if let Err(e) = self
                .checkpoints
                .mark_started(CheckpointScope::File, &key, Some(&path), &metadata)
            {
                collector.add_failure(file, e);
                continue;
            }

            let scope_key = format!("ingest:{key}");
            let result = self
                .transactions
                .run(&scope_key, |tx| process(path.as_path(), tx));

            match result {
                Ok(_) => match self
                    .checkpoints
                    .mark_completed(CheckpointScope::File, &key, Some(&path))
                {
                    Ok(()) => {
                        summary.processed += 1;
                        collector.add_success(file);
                    }
                    Err(e) => collector.add_failure(file, e),
                },
                Err(e @ PipelineError::CircuitOpen(_)) => {
                    let message = e.to_string();
                    self.record_failed(&key, &path, &message);
                    collector.add_failure(file, e);

                    let skipped: Vec<SourceFile> = remaining.by_ref().collect();
                    warn!(
                        skipped = skipped.len(),
                        "Circuit breaker open, skipping remaining files"
                    );
                    for file in skipped {
                        self.record_failed(&file.to_string(), file.path(), &message);
                        collector.add_failure(
                            file,
                            PipelineError::Transient(format!("skipped: {message}")),
                        );
                    }
                }
                Err(e) => {
                    self.record_failed(&key, &path, &e.to_string());
                    collector.add_failure(file, e);
                }
            }
        }

        collector.log_summary();
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = collector.get_failure_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Ingest finished"
        );

        collector.raise_if_failures(format!("Ingest failed for some of {total} files"))?;
        Ok(summary)
    }

    fn record_failed(&self, key: &str, path: &Path, message: &str) {
        if let Err(e) = self
            .checkpoints
            .mark_failed(CheckpointScope::File, key, message, Some(path))
        {
            error!(file = key, error = %e, "Cannot record failed checkpoint");
        }
    }
}
