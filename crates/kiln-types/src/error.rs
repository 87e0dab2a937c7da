//! Error taxonomy for artifacts and persistence.
//!
//! Artifact failures carry an `ErrorClass`: a dot-separated hierarchical tag
//! (e.g. `app.io.timeout`) matched by the exception classifier against the
//! skippable/retryable/no-rollback rule lists of a chunk step. This replaces
//! exception-class-hierarchy matching with an explicit, deterministic path
//! hierarchy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// A dot-separated error class path.
///
/// `app.io.timeout` is a subtype of `app.io`, which is a subtype of `app`.
/// Rule patterns match a class when they equal it or name one of its
/// ancestors; deeper patterns are more specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClass(String);

impl ErrorClass {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of path segments; used as the specificity measure.
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split('.').count()
        }
    }

    /// Whether `pattern` covers this class: equal, an ancestor path, or the
    /// wildcard `*`.
    pub fn is_covered_by(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        self.0 == pattern
            || (self.0.len() > pattern.len()
                && self.0.starts_with(pattern)
                && self.0.as_bytes()[pattern.len()] == b'.')
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorClass {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// BatchError
// ---------------------------------------------------------------------------

/// An error raised by a batch artifact (reader, processor, writer, batchlet,
/// decider, listener).
///
/// Carries the class tag the exception classifier matches against configured
/// rule lists. Errors with classes that match no retryable or skippable rule
/// are unhandled and fail the step.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{class}: {message}")]
pub struct BatchError {
    pub class: ErrorClass,
    pub message: String,
}

impl BatchError {
    /// Build an error with the given class tag.
    pub fn tagged(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::new(class),
            message: message.into(),
        }
    }

    /// Build an unclassified error; never matches skip/retry rules.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::new("unclassified"),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RepositoryError
// ---------------------------------------------------------------------------

/// Errors from repository operations (used by trait definitions in kiln-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_coverage() {
        let class = ErrorClass::new("app.io.timeout");
        assert!(class.is_covered_by("app.io.timeout"));
        assert!(class.is_covered_by("app.io"));
        assert!(class.is_covered_by("app"));
        assert!(class.is_covered_by("*"));
        assert!(!class.is_covered_by("app.parse"));
        assert!(!class.is_covered_by("app.i"), "segment boundaries respected");
        assert!(!class.is_covered_by("app.io.timeout.slow"));
    }

    #[test]
    fn test_error_class_depth() {
        assert_eq!(ErrorClass::new("app").depth(), 1);
        assert_eq!(ErrorClass::new("app.io.timeout").depth(), 3);
        assert_eq!(ErrorClass::new("").depth(), 0);
    }

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::tagged("app.io.timeout", "connection reset");
        assert_eq!(err.to_string(), "app.io.timeout: connection reset");

        let err = BatchError::unclassified("boom");
        assert_eq!(err.class.as_str(), "unclassified");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
