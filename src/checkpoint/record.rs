//! Checkpoint record types.

use crate::models::{Metadata, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Granularity of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointScope {
    /// Whole pipeline run
    Pipeline,
    /// One transformation model
    Model,
    /// One source file
    File,
    /// One named operation, such as a storage transaction
    Operation,
}

/// Progress of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CheckpointScope {
    pub const ALL: [Self; 4] = [Self::Pipeline, Self::Model, Self::File, Self::Operation];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Model => "model",
            Self::File => "file",
            Self::Operation => "operation",
        }
    }
}

impl CheckpointStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Work that a rerun still has to do.
    pub fn is_pending(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointScope {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown checkpoint scope '{s}'")))
    }
}

impl FromStr for CheckpointStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown checkpoint status '{s}'")))
    }
}

/// Durable record of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub scope: CheckpointScope,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub status: CheckpointStatus,
    /// Hex SHA-256 of `file_path` at the last mark
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Selects records for listing and clearing. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFilter {
    pub scope: Option<CheckpointScope>,
    pub key: Option<String>,
    pub status: Option<CheckpointStatus>,
}

impl CheckpointFilter {
    pub fn scope(scope: CheckpointScope) -> Self {
        Self {
            scope: Some(scope),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_status(mut self, status: CheckpointStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scope.is_none() && self.key.is_none() && self.status.is_none()
    }
}

/// Count and time range for one status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub count: usize,
    pub first_created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Aggregate view of a pipeline's checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStatistics {
    pub pipeline_name: String,
    pub by_status: BTreeMap<CheckpointStatus, StatusSummary>,
    pub by_scope: BTreeMap<CheckpointScope, usize>,
    pub total: usize,
}

impl CheckpointStatistics {
    pub fn count(&self, status: CheckpointStatus) -> usize {
        self.by_status.get(&status).map_or(0, |s| s.count)
    }
}
