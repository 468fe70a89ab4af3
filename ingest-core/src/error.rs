//! Crate-wide error type.
//!
//! All public entry points return `Result<_, IngestError>`. Lower layers (the
//! Postgres implementation in `ingest-storage`) keep their own, richer error
//! type internally and convert into one of these variants at the boundary —
//! see `ingest-storage::postgres::error::PostgresError`.

use std::fmt;

/// Errors the engine can return.
///
/// Validation, producer and load errors are returned immediately and are
/// never retried. `Conflict` is caught by the retry envelope and retried with
/// backoff; if retries are exhausted it surfaces as `Cancelled` with
/// `last_transient` set, or is returned as-is if the attempt budget is spent
/// without an intervening cancellation.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A config or declared-schema problem caught before any I/O happened.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller-supplied row writer failed while producing the snapshot.
    #[error("producer error: {0}")]
    Producer(String),

    /// The CSV could not be loaded into the store, or didn't match the
    /// declared schema.
    #[error("load error: {0}")]
    Load(String),

    /// A transient, retryable conflict was detected (e.g. serialization
    /// failure under an MVCC store). Callers should not normally see this
    /// variant directly: the retry envelope retries it internally and only
    /// lets it escape once the attempt budget is exhausted.
    #[error("transient conflict: {0}")]
    Conflict(String),

    /// The requested entity does not exist.
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// A uniqueness constraint was violated where the engine expected none
    /// to exist (e.g. a caller racing two ingestions of the same entity).
    #[error("duplicate {0}: {1}")]
    DuplicateEntry(String, String),

    /// The operation was cancelled. Carries the cancellation cause and, if
    /// the cancellation interrupted a retry loop, the last transient error
    /// observed before the cancellation was noticed.
    #[error("cancelled: {cause}{}", format_last_transient(.last_transient))]
    Cancelled {
        cause: String,
        last_transient: Option<String>,
    },

    /// Any other, non-retryable store failure.
    #[error("store error: {0}")]
    Store(String),
}

fn format_last_transient(last_transient: &Option<String>) -> String {
    match last_transient {
        Some(e) => format!(" (last transient error: {e})"),
        None => String::new(),
    }
}

impl IngestError {
    /// True if this variant is one the retry envelope should act on.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Conflict(_))
    }

    pub fn cancelled(cause: impl fmt::Display, last_transient: Option<IngestError>) -> Self {
        IngestError::Cancelled {
            cause: cause.to_string(),
            last_transient: last_transient.map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_without_prior_transient_has_no_suffix() {
        let err = IngestError::cancelled("context cancelled", None);
        assert_eq!(err.to_string(), "cancelled: context cancelled");
    }

    #[test]
    fn cancelled_carries_last_transient() {
        let err = IngestError::cancelled(
            "context cancelled",
            Some(IngestError::Conflict("serialization failure".into())),
        );
        assert_eq!(
            err.to_string(),
            "cancelled: context cancelled (last transient error: transient conflict: serialization failure)"
        );
    }

    #[test]
    fn only_conflict_is_transient() {
        assert!(IngestError::Conflict("x".into()).is_transient());
        assert!(!IngestError::Validation("x".into()).is_transient());
        assert!(!IngestError::Store("x".into()).is_transient());
    }
}
