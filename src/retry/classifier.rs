//! Table-driven error classification for retry decisions.
//!
//! Errors expose a structured [`ErrorKind`]; the [`ErrorClassifier`] maps
//! kinds to an [`ErrorCategory`]. Applications extend the table instead of
//! matching on error text.

use crate::models::{PipelineError, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;

/// How an error should be treated by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Temporary failure, may succeed on retry
    Transient,
    /// Will not resolve by retrying
    Permanent,
    /// Not in the table; retried optimistically
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Structured failure kind, the key of the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ConnectionReset,
    Throttled,
    ServiceUnavailable,
    /// Generic OS-level I/O failure
    Io,
    /// Caller explicitly flagged the failure as retryable
    Transient,
    AuthenticationFailed,
    AccessDenied,
    NotFound,
    InvalidInput,
    Validation,
    Configuration,
    CircuitOpen,
    Transaction,
    /// Caller explicitly flagged the failure as not retryable
    Permanent,
    Checkpoint,
    Internal,
    Other,
}

impl ErrorKind {
    /// Map an I/O error onto a classification kind.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted => Self::ConnectionReset,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::InvalidInput,
            _ => Self::Io,
        }
    }
}

/// Errors that can report their classification kind.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        PipelineError::kind(self)
    }
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        StorageError::kind(self)
    }
}

impl Classify for io::Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::from_io(self)
    }
}

/// Kind → category lookup table.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: HashMap<ErrorKind, ErrorCategory>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        use ErrorCategory::{Permanent, Transient};
        use ErrorKind as K;

        let rules = [
            (K::Timeout, Transient),
            (K::ConnectionReset, Transient),
            (K::Throttled, Transient),
            (K::ServiceUnavailable, Transient),
            (K::Io, Transient),
            (K::Transient, Transient),
            (K::AuthenticationFailed, Permanent),
            (K::AccessDenied, Permanent),
            (K::NotFound, Permanent),
            (K::InvalidInput, Permanent),
            (K::Validation, Permanent),
            (K::Configuration, Permanent),
            (K::CircuitOpen, Permanent),
            (K::Transaction, Permanent),
            (K::Permanent, Permanent),
        ];

        Self {
            rules: rules.into_iter().collect(),
        }
    }
}

impl ErrorClassifier {
    /// Classifier with the default table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier with an empty table: everything is `Unknown`.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Add or override a rule.
    pub fn with_rule(mut self, kind: ErrorKind, category: ErrorCategory) -> Self {
        self.rules.insert(kind, category);
        self
    }

    /// Add or override a rule in place.
    pub fn set_rule(&mut self, kind: ErrorKind, category: ErrorCategory) {
        self.rules.insert(kind, category);
    }

    pub fn category_of(&self, kind: ErrorKind) -> ErrorCategory {
        self.rules
            .get(&kind)
            .copied()
            .unwrap_or(ErrorCategory::Unknown)
    }

    pub fn classify<E: Classify + ?Sized>(&self, err: &E) -> ErrorCategory {
        self.category_of(err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let classifier = ErrorClassifier::new();

        assert_eq!(
            classifier.classify(&StorageError::Throttled("SlowDown".into())),
            ErrorCategory::Transient
        );
        assert_eq!(
            classifier.classify(&StorageError::AccessDenied("bucket".into())),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classifier.classify(&PipelineError::InvalidInput("bad csv".into())),
            ErrorCategory::Permanent
        );
        assert_eq!(
            classifier.classify(&PipelineError::Internal("?".into())),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_io_errors() {
        let classifier = ErrorClassifier::new();
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let other = io::Error::new(io::ErrorKind::Other, "disk hiccup");

        assert_eq!(classifier.classify(&timeout), ErrorCategory::Transient);
        assert_eq!(classifier.classify(&missing), ErrorCategory::Permanent);
        assert_eq!(classifier.classify(&other), ErrorCategory::Transient);
    }

    #[test]
    fn test_rules_can_be_overridden() {
        let classifier = ErrorClassifier::new()
            .with_rule(ErrorKind::NotFound, ErrorCategory::Transient)
            .with_rule(ErrorKind::Internal, ErrorCategory::Permanent);

        assert_eq!(
            classifier.classify(&StorageError::NotFound("eventually consistent".into())),
            ErrorCategory::Transient
        );
        assert!(!classifier.category_of(ErrorKind::Internal).is_retryable());
        assert!(ErrorClassifier::empty()
            .category_of(ErrorKind::Timeout)
            .is_retryable());
    }
}
