//! Error types for pipeguard.
//!
//! Taxonomy:
//! - Expected failures: bad input, missing objects, rejected validation
//! - Infrastructure failures: storage outages, timeouts, checkpoint I/O
//! - Guard rails: open circuits, failed rollbacks, invariant violations

use crate::retry::{CircuitOpenError, ErrorKind};
use thiserror::Error;

/// Top-level error type for pipeguard.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED: caller supplied something that cannot succeed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Validation failed for {key}: {reason}")]
    Validation { key: String, reason: String },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE: dependency failed, maybe temporarily
    // ═══════════════════════════════════════════════════════════════════

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Checkpoint store error: {context}")]
    Checkpoint {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // GUARD RAILS: protective mechanisms tripped
    // ═══════════════════════════════════════════════════════════════════

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Rollback completed with {} error(s): {}", .failures.len(), .failures.join("; "))]
    Rollback { failures: Vec<String> },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Object store failures.
///
/// Variants mirror the response classes object stores actually return so the
/// retry classifier can tell throttling from a missing key.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("IO error on {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Create an IO error for an object key.
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Classification kind of this storage failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::InvalidKey(_) => ErrorKind::InvalidInput,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Throttled(_) => ErrorKind::Throttled,
            Self::Unavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Io { source, .. } => ErrorKind::from_io(source),
        }
    }
}

impl PipelineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a checkpoint store error with context.
    pub fn checkpoint(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Checkpoint {
            context: context.into(),
            source,
        }
    }

    /// Create a validation error for a staged object.
    pub fn validation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Classification kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Storage(e) => e.kind(),
            Self::Checkpoint { .. } => ErrorKind::Checkpoint,
            Self::Io { source, .. } => ErrorKind::from_io(source),
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Rollback { .. } | Self::Transaction(_) => ErrorKind::Transaction,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias for pipeguard.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_storage_kinds() {
        assert_eq!(
            StorageError::Throttled("slow down".into()).kind(),
            ErrorKind::Throttled
        );
        assert_eq!(
            StorageError::io("k", io::Error::new(io::ErrorKind::TimedOut, "t")).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            PipelineError::from(StorageError::NotFound("k".into())).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_rollback_display_lists_failures() {
        let err = PipelineError::Rollback {
            failures: vec!["a: denied".into(), "b: timeout".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("a: denied; b: timeout"));
    }
}
