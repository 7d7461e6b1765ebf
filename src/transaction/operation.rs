//! Transaction bookkeeping types.

use crate::models::Metadata;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Open, nothing staged yet
    Pending,
    /// At least one object staged
    Staged,
    /// Validators running
    Validating,
    /// Every staged object promoted to its target
    Committed,
    /// Staged objects removed after a failure
    RolledBack,
    /// Rollback could not remove every staged object
    Failed,
}

impl TransactionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Staged)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Staged => "STAGED",
            Self::Validating => "VALIDATING",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where a staged object came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum StagedSource {
    /// Uploaded from a local file
    File(PathBuf),
    /// Copied from another object in the store
    Object(String),
}

impl fmt::Display for StagedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Object(key) => f.write_str(key),
        }
    }
}

/// One object written to staging and waiting for promotion.
#[derive(Debug, Clone, Serialize)]
pub struct StagedOperation {
    pub source: StagedSource,
    pub staging_key: String,
    pub target_key: String,
    pub metadata: Metadata,
    /// Copied to `target_key`
    pub committed: bool,
}

impl StagedOperation {
    /// Local file backing this operation, used for checksums.
    pub fn local_path(&self) -> Option<&std::path::Path> {
        match &self.source {
            StagedSource::File(path) => Some(path),
            StagedSource::Object(_) => None,
        }
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    pub transaction_id: String,
    pub scope_key: String,
    pub state: TransactionState,
    /// Target keys written by this transaction
    pub committed: Vec<String>,
    /// Target keys left alone because their source was already committed
    pub skipped: Vec<String>,
}

impl TransactionReport {
    /// Nothing was written because every source was already committed.
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty() && !self.skipped.is_empty()
    }
}
