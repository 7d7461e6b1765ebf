//! Staged, all-or-nothing object store commits.
//!
//! Protocol:
//! 1. Stage: every write lands under `<staging_prefix>/<transaction_id>/<target_key>`
//! 2. Validate: registered validators inspect each staged object
//! 3. Commit: each staged object is copied to its target key
//! 4. Cleanup: staging is emptied, checkpoints are marked COMPLETED
//!
//! Any failure before COMMITTED deletes the staged objects and marks the
//! checkpoints FAILED. Every store call goes through the retry executor;
//! staging and promotion calls also go through the optional circuit breaker.
//!
//! Transaction ids are UUIDv7, so the age of a staging directory can be read
//! from its name.

use super::operation::{StagedOperation, StagedSource, TransactionReport, TransactionState};
use super::validators::Validator;
use crate::checkpoint::{CheckpointScope, CheckpointStore};
use crate::models::{Metadata, PipelineError, Result, TransactionConfig};
use crate::retry::{CircuitBreaker, RetryExecutor};
use crate::storage::{validate_key, ObjectStore, StorageResult};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use tracing::{debug, error, info, warn};

type ActiveSet = Arc<Mutex<HashSet<String>>>;

fn lock_active(active: &ActiveSet) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Time since the transaction `tx_id` began, or `None` if the id is not a
/// UUIDv7.
fn transaction_age(tx_id: &str, now: Duration) -> Option<Duration> {
    let (secs, nanos) = Uuid::parse_str(tx_id).ok()?.get_timestamp()?.to_unix();
    Some(now.saturating_sub(Duration::new(secs, nanos)))
}

/// Run one store call through `retry`, and through `breaker` when set.
fn store_call<T, F>(
    retry: &RetryExecutor,
    breaker: Option<&CircuitBreaker>,
    name: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> StorageResult<T>,
{
    match breaker {
        Some(breaker) => {
            retry.execute_guarded(name, breaker, || call().map_err(PipelineError::from))
        }
        None => retry.execute(name, call).map_err(PipelineError::from),
    }
}

/// Opens transactions against one object store.
pub struct TransactionManager {
    store: Arc<dyn ObjectStore>,
    checkpoints: Option<Arc<CheckpointStore>>,
    config: TransactionConfig,
    retry: RetryExecutor,
    breaker: Option<Arc<CircuitBreaker>>,
    active: ActiveSet,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransactionConfig) -> Self {
        Self {
            store,
            checkpoints: None,
            config,
            retry: RetryExecutor::default(),
            breaker: None,
            active: Arc::default(),
        }
    }

    /// Record FILE and OPERATION checkpoints, and skip already committed files.
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Retry executor used for every store call.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Guard staging and promotion calls with `breaker`.
    ///
    /// Only store failures count against it; errors raised by the caller's
    /// own processing never do.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Ids of transactions that are open in this manager.
    pub fn active_transactions(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock_active(&self.active).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Open a transaction for `scope_key`.
    ///
    /// The OPERATION checkpoint for `scope_key` is marked IN_PROGRESS.
    pub fn begin(&self, scope_key: &str) -> Result<Transaction> {
        if scope_key.is_empty() {
            return Err(PipelineError::InvalidInput(
                "transaction scope key must not be empty".to_string(),
            ));
        }

        let id = Uuid::now_v7().to_string();
        if let Some(checkpoints) = &self.checkpoints {
            let metadata = Metadata::from([("transaction_id".to_string(), id.clone())]);
            checkpoints.mark_started(CheckpointScope::Operation, scope_key, None, &metadata)?;
        }
        lock_active(&self.active).insert(id.clone());

        info!(tx_id = %id, scope_key, "Transaction started");
        Ok(Transaction {
            id,
            scope_key: scope_key.to_string(),
            state: TransactionState::Pending,
            operations: Vec::new(),
            skipped: Vec::new(),
            validators: Vec::new(),
            store: Arc::clone(&self.store),
            checkpoints: self.checkpoints.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
            active: Arc::clone(&self.active),
            finished: false,
        })
    }

    /// Run `body` inside a transaction.
    ///
    /// Commits when `body` returns `Ok`; rolls back and returns the body's
    /// error otherwise.
    pub fn run<F>(&self, scope_key: &str, body: F) -> Result<TransactionReport>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut tx = self.begin(scope_key)?;
        if let Err(e) = body(&mut tx) {
            tx.abort(&e);
            return Err(e);
        }
        tx.commit()
    }

    /// Delete staged objects left behind by crashed runs.
    ///
    /// An object is orphaned when its transaction is not open in this
    /// manager and began at least `orphan_min_age_secs` ago. Transactions
    /// of other processes are only told apart by that age, so it must
    /// exceed the longest transaction. Staging directories whose name is not
    /// a transaction id are left alone. Returns the number of objects
    /// removed.
    pub fn cleanup_orphaned_staging(&self) -> Result<usize> {
        let prefix = format!("{}/", self.config.staging_prefix.trim_matches('/'));
        let keys = self
            .retry
            .execute("list staging", || self.store.list(&prefix))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let min_age = self.config.orphan_min_age();
        let active = lock_active(&self.active).clone();
        let mut removed = 0;
        for key in keys {
            let tx_id = key[prefix.len()..].split('/').next().unwrap_or_default();
            if active.contains(tx_id) {
                continue;
            }
            match transaction_age(tx_id, now) {
                Some(age) if age >= min_age => {}
                Some(_) => {
                    debug!(key = %key, "Staging object too young to sweep");
                    continue;
                }
                None => {
                    debug!(key = %key, "Not a transaction staging object, leaving it");
                    continue;
                }
            }
            self.retry
                .execute("delete orphaned staging", || self.store.delete(&key))?;
            debug!(key = %key, "Removed orphaned staging object");
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Cleaned up orphaned staging objects");
        }
        Ok(removed)
    }
}

/// An open set of staged writes.
///
/// Finish with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    id: String,
    scope_key: String,
    state: TransactionState,
    operations: Vec<StagedOperation>,
    skipped: Vec<String>,
    validators: Vec<(String, Validator)>,
    store: Arc<dyn ObjectStore>,
    checkpoints: Option<Arc<CheckpointStore>>,
    config: TransactionConfig,
    retry: RetryExecutor,
    breaker: Option<Arc<CircuitBreaker>>,
    active: ActiveSet,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn operations(&self) -> &[StagedOperation] {
        &self.operations
    }

    /// Current progress, usable before the transaction finishes.
    pub fn report(&self) -> TransactionReport {
        TransactionReport {
            transaction_id: self.id.clone(),
            scope_key: self.scope_key.clone(),
            state: self.state,
            committed: self
                .operations
                .iter()
                .filter(|op| op.committed)
                .map(|op| op.target_key.clone())
                .collect(),
            skipped: self.skipped.clone(),
        }
    }

    fn staging_key(&self, target_key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.staging_prefix.trim_matches('/'),
            self.id,
            target_key
        )
    }

    fn store_call<T, F>(&self, name: &str, call: F) -> Result<T>
    where
        F: FnMut() -> StorageResult<T>,
    {
        store_call(&self.retry, self.breaker.as_deref(), name, call)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished || !self.state.is_open() {
            return Err(PipelineError::Transaction(format!(
                "transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Stage a local file for `target_key`.
    ///
    /// Returns `false` without writing anything when the FILE checkpoint for
    /// `target_key` is COMPLETED and the file still has the same checksum.
    pub fn upload_file(
        &mut self,
        local_path: &Path,
        target_key: &str,
        metadata: Metadata,
    ) -> Result<bool> {
        self.ensure_open()?;
        validate_key(target_key)?;

        if let Some(checkpoints) = &self.checkpoints {
            let path = Some(local_path);
            if checkpoints.is_completed(CheckpointScope::File, target_key, path, true)? {
                info!(tx_id = %self.id, target_key, "Already committed, skipping upload");
                self.skipped.push(target_key.to_string());
                return Ok(false);
            }
        }

        let staging_key = self.staging_key(target_key);
        self.store_call(&format!("upload {target_key}"), || {
            self.store.put(local_path, &staging_key, &metadata)
        })?;

        debug!(tx_id = %self.id, staging_key = %staging_key, "Staged upload");
        self.operations.push(StagedOperation {
            source: StagedSource::File(local_path.to_path_buf()),
            staging_key,
            target_key: target_key.to_string(),
            metadata,
            committed: false,
        });
        self.state = TransactionState::Staged;
        Ok(true)
    }

    /// Stage a copy of an existing object for `target_key`.
    ///
    /// Used to promote objects between environments. Metadata is carried
    /// over from the source object.
    pub fn stage_object(&mut self, source_key: &str, target_key: &str) -> Result<()> {
        self.ensure_open()?;
        validate_key(target_key)?;

        let staging_key = self.staging_key(target_key);
        self.store_call(&format!("stage {source_key}"), || {
            self.store.copy(source_key, &staging_key)
        })?;
        let metadata =
            self.store_call("read staged metadata", || self.store.metadata(&staging_key))?;

        debug!(tx_id = %self.id, source_key, staging_key = %staging_key, "Staged copy");
        self.operations.push(StagedOperation {
            source: StagedSource::Object(source_key.to_string()),
            staging_key,
            target_key: target_key.to_string(),
            metadata,
            committed: false,
        });
        self.state = TransactionState::Staged;
        Ok(())
    }

    /// Register a check to run on every staged object before commit.
    pub fn add_validator(&mut self, name: impl Into<String>, validator: Validator) {
        self.validators.push((name.into(), validator));
    }

    /// Validate and promote every staged object.
    ///
    /// On failure the transaction is rolled back and the triggering error is
    /// returned. A checkpoint failure after the objects are promoted is
    /// returned as well, but the promoted objects stay in place.
    pub fn commit(mut self) -> Result<TransactionReport> {
        self.ensure_open()?;

        if let Err(e) = self.promote() {
            self.abort(&e);
            return Err(e);
        }

        self.state = TransactionState::Committed;
        self.finish();
        self.cleanup_staging();
        self.mark_committed()?;

        let report = self.report();
        info!(
            tx_id = %self.id,
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            "Transaction committed"
        );
        Ok(report)
    }

    /// Abandon the transaction and delete everything staged.
    ///
    /// Returns a rollback error if some staged objects could not be deleted.
    pub fn rollback(mut self, reason: &str) -> Result<()> {
        let failures = self.roll_back(reason);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Rollback { failures })
        }
    }

    /// Roll back after `cause`; rollback problems are logged, not returned.
    fn abort(&mut self, cause: &PipelineError) {
        let failures = self.roll_back(&cause.to_string());
        if !failures.is_empty() {
            let rollback = PipelineError::Rollback { failures };
            error!(tx_id = %self.id, error = %rollback, original = %cause, "Rollback incomplete");
        }
    }

    /// Validate then copy each staged object to its target.
    fn promote(&mut self) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }

        self.state = TransactionState::Validating;
        for op in &self.operations {
            for (name, validator) in &self.validators {
                validator(self.store.as_ref(), op).map_err(|e| {
                    warn!(
                        tx_id = %self.id,
                        validator = %name,
                        target = %op.target_key,
                        error = %e,
                        "Validation failed"
                    );
                    e
                })?;
            }
        }

        let existed = if self.config.compensate_partial_commit {
            self.existing_targets()
        } else {
            Vec::new()
        };

        for i in 0..self.operations.len() {
            let (staging_key, target_key) = {
                let op = &self.operations[i];
                (op.staging_key.clone(), op.target_key.clone())
            };
            let copied = self.store_call(&format!("commit {target_key}"), || {
                self.store.copy(&staging_key, &target_key)
            });

            if let Err(e) = copied {
                if i > 0 {
                    self.compensate(&existed);
                }
                return Err(e);
            }
            self.operations[i].committed = true;
        }

        Ok(())
    }

    /// Whether each target existed before this transaction touched it.
    ///
    /// Unknown answers count as existing so compensation never deletes them.
    fn existing_targets(&self) -> Vec<bool> {
        self.operations
            .iter()
            .map(|op| {
                self.retry
                    .execute("check target", || self.store.exists(&op.target_key))
                    .unwrap_or_else(|e| {
                        warn!(target = %op.target_key, error = %e, "Cannot check target");
                        true
                    })
            })
            .collect()
    }

    /// Undo a partial commit as far as possible.
    ///
    /// Targets created by this transaction are deleted; overwritten targets
    /// cannot be restored and are only reported.
    fn compensate(&mut self, existed: &[bool]) {
        if !self.config.compensate_partial_commit {
            warn!(
                tx_id = %self.id,
                committed = self.operations.iter().filter(|op| op.committed).count(),
                "Partial commit left in place"
            );
            return;
        }

        for (i, op) in self.operations.iter_mut().enumerate() {
            if !op.committed {
                continue;
            }
            if existed.get(i).copied().unwrap_or(true) {
                warn!(
                    tx_id = %self.id,
                    target = %op.target_key,
                    "Overwritten target cannot be restored"
                );
                continue;
            }
            let deleted = self
                .retry
                .execute("compensate commit", || self.store.delete(&op.target_key));
            match deleted {
                Ok(()) => {
                    op.committed = false;
                    info!(
                        tx_id = %self.id,
                        target = %op.target_key,
                        "Removed partially committed target"
                    );
                }
                Err(e) => {
                    error!(
                        tx_id = %self.id,
                        target = %op.target_key,
                        error = %e,
                        "Cannot remove partially committed target"
                    );
                }
            }
        }
    }

    /// Delete staged objects and mark checkpoints FAILED.
    ///
    /// Returns the cleanup failures, one line per object.
    fn roll_back(&mut self, reason: &str) -> Vec<String> {
        let mut failures = Vec::new();
        for op in &self.operations {
            let deleted = self
                .retry
                .execute("rollback", || self.store.delete(&op.staging_key));
            if let Err(e) = deleted {
                error!(
                    tx_id = %self.id,
                    staging_key = %op.staging_key,
                    error = %e,
                    "Cannot delete staged object"
                );
                failures.push(format!("{}: {e}", op.staging_key));
            }
        }

        if let Some(checkpoints) = &self.checkpoints {
            for op in &self.operations {
                let marked = checkpoints.mark_failed(
                    CheckpointScope::File,
                    &op.target_key,
                    reason,
                    op.local_path(),
                );
                if let Err(e) = marked {
                    error!(
                        tx_id = %self.id,
                        target = %op.target_key,
                        error = %e,
                        "Cannot record failed checkpoint"
                    );
                }
            }
            let marked =
                checkpoints.mark_failed(CheckpointScope::Operation, &self.scope_key, reason, None);
            if let Err(e) = marked {
                error!(tx_id = %self.id, error = %e, "Cannot record failed checkpoint");
            }
        }

        self.state = if failures.is_empty() {
            TransactionState::RolledBack
        } else {
            TransactionState::Failed
        };
        self.finish();

        warn!(tx_id = %self.id, reason, staged = self.operations.len(), "Transaction rolled back");
        failures
    }

    /// Best-effort removal of staged objects after commit.
    fn cleanup_staging(&self) {
        for op in &self.operations {
            let deleted = self
                .retry
                .execute("cleanup staging", || self.store.delete(&op.staging_key));
            if let Err(e) = deleted {
                warn!(
                    tx_id = %self.id,
                    staging_key = %op.staging_key,
                    error = %e,
                    "Cannot delete staged object"
                );
            }
        }
    }

    fn mark_committed(&self) -> Result<()> {
        let Some(checkpoints) = &self.checkpoints else {
            return Ok(());
        };
        for op in &self.operations {
            checkpoints.mark_completed(CheckpointScope::File, &op.target_key, op.local_path())?;
        }
        checkpoints.mark_completed(CheckpointScope::Operation, &self.scope_key, None)
    }

    fn finish(&mut self) {
        self.finished = true;
        lock_active(&self.active).remove(&self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                tx_id = %self.id,
                staged = self.operations.len(),
                "Transaction dropped without commit or rollback, rolling back"
            );
            self.roll_back("transaction dropped without commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStatus;
    use crate::retry::{CircuitState, RetryPolicy};
    use crate::storage::{FaultKind, MemoryObjectStore, StoreOp};
    use crate::transaction::validators;
    use std::fs;
    use tempfile::TempDir;
    use uuid::{NoContext, Timestamp};

    /// Transaction id of a run that began `age` ago.
    fn tx_id_aged(age: Duration) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let began = now - age;
        let ts = Timestamp::from_unix(NoContext, began.as_secs(), began.subsec_nanos());
        Uuid::new_v7(ts).to_string()
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryObjectStore>,
        checkpoints: Arc<CheckpointStore>,
        manager: TransactionManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let checkpoints = Arc::new(CheckpointStore::open_in_memory("test").unwrap());
        let manager = TransactionManager::new(store.clone(), TransactionConfig::default())
            .with_checkpoints(Arc::clone(&checkpoints))
            .with_retry(RetryExecutor::new(RetryPolicy::immediate(3)));
        Fixture {
            dir,
            store,
            checkpoints,
            manager,
        }
    }

    impl Fixture {
        fn file(&self, name: &str, content: &str) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn staging_keys(&self) -> Vec<String> {
            self.store.list("staging/").unwrap()
        }
    }

    #[test]
    fn test_commit_promotes_all_and_empties_staging() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let b = fx.file("b.csv", "2");

        let report = fx
            .manager
            .run("ingest/wdi", |tx| {
                tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
                tx.upload_file(&b, "landing/b.csv", Metadata::new())?;
                Ok(())
            })
            .unwrap();

        assert_eq!(report.state, TransactionState::Committed);
        assert_eq!(report.committed, ["landing/a.csv", "landing/b.csv"]);
        assert!(fx.store.exists("landing/a.csv").unwrap());
        assert!(fx.store.exists("landing/b.csv").unwrap());
        assert!(fx.staging_keys().is_empty());
        assert!(fx.manager.active_transactions().is_empty());
        assert!(fx
            .checkpoints
            .is_completed(CheckpointScope::Operation, "ingest/wdi", None, false)
            .unwrap());
    }

    #[test]
    fn test_error_before_commit_leaves_nothing() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let b = fx.file("b.csv", "2");

        let err = fx
            .manager
            .run("ingest/wdi", |tx| {
                tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
                tx.upload_file(&b, "landing/b.csv", Metadata::new())?;
                Err(PipelineError::Permanent("parse failed".into()))
            })
            .unwrap_err();

        assert!(err.to_string().contains("parse failed"));
        assert!(fx.store.keys().is_empty());

        let record = fx
            .checkpoints
            .get(CheckpointScope::Operation, "ingest/wdi")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, CheckpointStatus::Failed);
        assert!(record.error_message.unwrap().contains("parse failed"));
    }

    #[test]
    fn test_rerun_with_unchanged_files_writes_nothing() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let b = fx.file("b.csv", "2");
        let upload_both = |tx: &mut Transaction| -> Result<()> {
            tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
            tx.upload_file(&b, "landing/b.csv", Metadata::new())?;
            Ok(())
        };

        fx.manager.run("ingest/wdi", upload_both).unwrap();
        let writes = fx.store.write_count();

        let report = fx.manager.run("ingest/wdi", upload_both).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(fx.store.write_count(), writes);

        // A changed source is uploaded again
        fs::write(&b, "changed").unwrap();
        let report = fx.manager.run("ingest/wdi", upload_both).unwrap();
        assert_eq!(report.committed, ["landing/b.csv"]);
        assert_eq!(fx.store.get("landing/b.csv").unwrap(), b"changed");
    }

    #[test]
    fn test_validator_failure_rolls_back() {
        let fx = fixture();
        let empty = fx.file("empty.csv", "");

        let mut tx = fx.manager.begin("ingest/empty").unwrap();
        tx.add_validator("non_empty", validators::non_empty());
        tx.upload_file(&empty, "landing/empty.csv", Metadata::new())
            .unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert!(fx.store.keys().is_empty());
        assert_eq!(
            fx.checkpoints
                .get_status(CheckpointScope::File, "landing/empty.csv")
                .unwrap(),
            Some(CheckpointStatus::Failed)
        );
    }

    #[test]
    fn test_transient_staging_failure_is_retried() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        fx.store
            .fail_times(StoreOp::Put, "landing/a.csv", FaultKind::Throttled, 2);

        let report = fx
            .manager
            .run("ingest/a", |tx| {
                tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
                Ok(())
            })
            .unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(fx.store.op_count(StoreOp::Put), 3);
    }

    #[test]
    fn test_partial_commit_is_compensated() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let b = fx.file("b.csv", "2");
        fx.store.put_bytes("landing/old.csv", b"old", &Metadata::new()).unwrap();
        let old = fx.file("old.csv", "new");
        fx.store
            .fail(StoreOp::Copy, "landing/b.csv", FaultKind::AccessDenied);

        let err = fx
            .manager
            .run("ingest/mixed", |tx| {
                tx.upload_file(&old, "landing/old.csv", Metadata::new())?;
                tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
                tx.upload_file(&b, "landing/b.csv", Metadata::new())?;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
        // Newly created target removed, overwritten target stays
        assert!(!fx.store.exists("landing/a.csv").unwrap());
        assert!(!fx.store.exists("landing/b.csv").unwrap());
        assert_eq!(fx.store.get("landing/old.csv").unwrap(), b"new");
        assert!(fx.staging_keys().is_empty());
    }

    #[test]
    fn test_partial_commit_left_when_compensation_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let config = TransactionConfig {
            compensate_partial_commit: false,
            ..Default::default()
        };
        let manager = TransactionManager::new(store.clone(), config)
            .with_retry(RetryExecutor::new(RetryPolicy::immediate(1)));

        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        fs::write(&a, "1").unwrap();
        fs::write(&b, "2").unwrap();
        store.fail(StoreOp::Copy, "landing/b.csv", FaultKind::Unavailable);

        let result = manager.run("x", |tx| {
            tx.upload_file(&a, "landing/a.csv", Metadata::new())?;
            tx.upload_file(&b, "landing/b.csv", Metadata::new())?;
            Ok(())
        });

        assert!(result.is_err());
        assert!(store.exists("landing/a.csv").unwrap());
        assert!(store.list("staging/").unwrap().is_empty());
    }

    #[test]
    fn test_rollback_reports_cleanup_failures() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let mut tx = fx.manager.begin("ingest/a").unwrap();
        tx.upload_file(&a, "landing/a.csv", Metadata::new()).unwrap();
        fx.store.fail(StoreOp::Delete, "staging/", FaultKind::AccessDenied);

        let err = tx.rollback("operator abort").unwrap_err();
        assert!(matches!(err, PipelineError::Rollback { ref failures } if failures.len() == 1));
        assert!(!fx.store.exists("landing/a.csv").unwrap());
    }

    #[test]
    fn test_drop_rolls_back() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        {
            let mut tx = fx.manager.begin("ingest/a").unwrap();
            tx.upload_file(&a, "landing/a.csv", Metadata::new()).unwrap();
            assert_eq!(fx.staging_keys().len(), 1);
        }
        assert!(fx.staging_keys().is_empty());
        assert!(fx.manager.active_transactions().is_empty());
    }

    #[test]
    fn test_stage_object_promotes_between_environments() {
        let fx = fixture();
        let meta = Metadata::from([("env".to_string(), "qa".to_string())]);
        fx.store.put_bytes("qa/marts/gdp.parquet", b"data", &meta).unwrap();

        fx.manager
            .run("promote/prod", |tx| {
                tx.stage_object("qa/marts/gdp.parquet", "prod/marts/gdp.parquet")
            })
            .unwrap();

        assert_eq!(fx.store.get("prod/marts/gdp.parquet").unwrap(), b"data");
        assert_eq!(fx.store.metadata("prod/marts/gdp.parquet").unwrap(), meta);
    }

    #[test]
    fn test_cleanup_orphaned_staging_spares_active() {
        let fx = fixture();
        let old_tx = tx_id_aged(Duration::from_secs(2 * 86400));
        let dead = format!("staging/{old_tx}/landing/a.csv");
        fx.store.put_bytes(&dead, b"x", &Metadata::new()).unwrap();
        fx.store
            .put_bytes("staging/manual/notes.txt", b"keep", &Metadata::new())
            .unwrap();
        let a = fx.file("a.csv", "1");

        let mut tx = fx.manager.begin("ingest/a").unwrap();
        tx.upload_file(&a, "landing/a.csv", Metadata::new()).unwrap();

        assert_eq!(fx.manager.cleanup_orphaned_staging().unwrap(), 1);
        assert!(!fx.store.exists(&dead).unwrap());
        assert!(fx.store.exists("staging/manual/notes.txt").unwrap());
        assert_eq!(fx.staging_keys().len(), 2);

        tx.commit().unwrap();
        assert_eq!(fx.staging_keys(), ["staging/manual/notes.txt"]);
    }

    #[test]
    fn test_sweep_from_another_manager_keeps_live_transaction() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let mut tx = fx.manager.begin("ingest/a").unwrap();
        tx.upload_file(&a, "landing/a.csv", Metadata::new()).unwrap();

        // A separate process sees no active transactions of its own
        let sweeper = TransactionManager::new(fx.store.clone(), TransactionConfig::default());
        assert_eq!(sweeper.cleanup_orphaned_staging().unwrap(), 0);
        assert_eq!(fx.staging_keys().len(), 1);

        let report = tx.commit().unwrap();
        assert_eq!(report.committed, ["landing/a.csv"]);
        assert_eq!(fx.store.get("landing/a.csv").unwrap(), b"1");
    }

    #[test]
    fn test_upload_after_promotion_replaces_target() {
        let fx = fixture();
        fx.store
            .put_bytes("qa/x.parquet", b"old", &Metadata::new())
            .unwrap();
        fx.manager
            .run("promote/prod", |tx| tx.stage_object("qa/x.parquet", "prod/x.parquet"))
            .unwrap();
        assert_eq!(fx.store.get("prod/x.parquet").unwrap(), b"old");

        let local = fx.file("x.parquet", "new");
        let report = fx
            .manager
            .run("upload/prod", |tx| {
                tx.upload_file(&local, "prod/x.parquet", Metadata::new())?;
                Ok(())
            })
            .unwrap();

        assert_eq!(report.committed, ["prod/x.parquet"]);
        assert!(report.skipped.is_empty());
        assert_eq!(fx.store.get("prod/x.parquet").unwrap(), b"new");
    }

    #[test]
    fn test_breaker_counts_store_failures_only() {
        let fx = fixture();
        let breaker = Arc::new(CircuitBreaker::new("object_store", 2, Duration::from_secs(60)));
        let manager = TransactionManager::new(fx.store.clone(), TransactionConfig::default())
            .with_retry(RetryExecutor::new(RetryPolicy::immediate(1)))
            .with_breaker(Arc::clone(&breaker));
        let a = fx.file("a.csv", "1");

        for _ in 0..3 {
            let err = manager
                .run("bad", |_| Err(PipelineError::validation("a.csv", "bad header")))
                .unwrap_err();
            assert!(matches!(err, PipelineError::Validation { .. }));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        fx.store.fail(StoreOp::Put, "landing/", FaultKind::Unavailable);
        for _ in 0..2 {
            let err = manager
                .run("up", |tx| tx.upload_file(&a, "landing/a.csv", Metadata::new()).map(drop))
                .unwrap_err();
            assert!(matches!(err, PipelineError::Storage(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let puts = fx.store.op_count(StoreOp::Put);
        let err = manager
            .run("up", |tx| tx.upload_file(&a, "landing/a.csv", Metadata::new()).map(drop))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CircuitOpen(_)));
        assert_eq!(fx.store.op_count(StoreOp::Put), puts);
    }

    #[test]
    fn test_finished_transaction_rejects_staging() {
        let fx = fixture();
        let a = fx.file("a.csv", "1");
        let mut tx = fx.manager.begin("x").unwrap();
        tx.state = TransactionState::Committed;
        let err = tx.upload_file(&a, "landing/a.csv", Metadata::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Transaction(_)));
        tx.finished = true;
    }
}
