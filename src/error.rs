//! Error types, split the way they propagate.
//!
//! [`LoaderError`] covers caller errors: they surface immediately from the
//! offending operation, whatever the error policy. [`BatchError`] covers batch
//! errors: they live in the result tables as `error(cause)` outcomes and only
//! surface through `get`, filtered by the policy layer.

use std::time::Duration;

use thiserror::Error;

use crate::key::{BatchKey, Key};

/// Boxed error type for user callbacks and repo backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors raised directly by loader operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoaderError {
    /// Invalid option at loader or source construction.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// `load`/`get` named a source that is not bound.
    #[error("unknown source: {name}")]
    UnknownSource { name: String },

    /// `get` for a pair that was never loaded, or was loaded after the most
    /// recent `run`. A programming error, not a backend error.
    #[error("unrun batch {batch} / item {item} on source {source_name}")]
    Unrun { source_name: String, batch: BatchKey, item: Key },

    /// A batch error escalated by `ErrorPolicy::Fail`.
    #[error("get on source {source} failed: {error}")]
    Get {
        source: String,
        #[source]
        error: BatchError,
    },
}

impl LoaderError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        LoaderError::Config { message: message.into() }
    }
}

/// Errors recorded per batch item during a `run`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    /// Coercion from a caller-supplied item key to the entity's declared
    /// primary-key type failed.
    #[error("bad id for {entity}: {id} is not a valid {expected}")]
    BadId { entity: String, id: Key, expected: &'static str },

    /// A single-valued load matched more than one row.
    #[error("multiple results for {batch}: expected at most one row, got {count}")]
    MultipleResults { batch: String, count: usize },

    /// A user-supplied `run_batch` returned a malformed result.
    #[error("run_batch protocol violation: {message}")]
    Protocol { message: String },

    /// The underlying store or callback raised.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// The per-batch deadline was exceeded.
    #[error("batch timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl BatchError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        BatchError::Backend { message: err.to_string() }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        BatchError::Protocol { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test: error variants are distinguishable by discriminant, not message.
    #[test]
    fn variants_match_by_discriminant() {
        let err = BatchError::Timeout { timeout: Duration::from_secs(1) };
        assert!(matches!(err, BatchError::Timeout { .. }));

        let err = LoaderError::UnknownSource { name: "kv".into() };
        assert!(matches!(err, LoaderError::UnknownSource { .. }));
    }

    // Test: Get wraps the batch error as its source.
    #[test]
    fn get_error_carries_cause() {
        let cause = BatchError::backend("boom");
        let err = LoaderError::Get { source: "db".into(), error: cause.clone() };
        match err {
            LoaderError::Get { error, .. } => assert_eq!(error, cause),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
