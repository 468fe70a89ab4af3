//! Diesel error classification (§7).
//!
//! An internal newtype wraps the crate-wide `IngestError`, and a single
//! function inspects a `diesel::result::Error` to decide which variant it
//! becomes. The one addition this domain needs is transient-conflict
//! classification (§4.7, §9 "Conflict retry by substring") — identifying
//! serialization failures and deadlocks under Postgres's `SERIALIZABLE`/
//! `REPEATABLE READ` isolation so the retry envelope knows what to retry.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use ingest_core::error::IngestError;

/// Message substrings that identify a transient, retryable conflict.
///
/// Centralised here rather than scattered across call sites, per §9: the
/// list can grow (e.g. to cover a future store) without touching the retry
/// loop itself.
const TRANSIENT_MESSAGE_SUBSTRINGS: &[&str] = &[
    "could not serialize access",
    "deadlock detected",
    "concurrent update",
    "restart transaction",
];

pub(crate) struct PostgresError(pub IngestError);

impl From<DieselError> for PostgresError {
    fn from(value: DieselError) -> Self {
        PostgresError(classify(value))
    }
}

impl From<PostgresError> for IngestError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<IngestError> for PostgresError {
    fn from(value: IngestError) -> Self {
        PostgresError(value)
    }
}

/// `diesel_async::AsyncConnection::transaction` requires its error type to
/// implement `From<diesel::result::Error>` (so it can report a failed COMMIT
/// or ROLLBACK); the orphan rules block that impl directly on `IngestError`,
/// since neither it nor `diesel::result::Error` is local to this crate. This
/// newtype carries an `IngestError` across a transaction boundary and back.
pub(crate) struct TxError(pub IngestError);

impl From<DieselError> for TxError {
    fn from(value: DieselError) -> Self {
        TxError(classify(value))
    }
}

impl From<IngestError> for TxError {
    fn from(value: IngestError) -> Self {
        TxError(value)
    }
}

impl From<TxError> for IngestError {
    fn from(value: TxError) -> Self {
        value.0
    }
}

fn classify(err: DieselError) -> IngestError {
    let message = err.to_string();
    if is_transient_message(&message) {
        return IngestError::Conflict(message);
    }
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
            IngestError::Conflict(message)
        }
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, details) => {
            IngestError::DuplicateEntry(
                details
                    .table_name()
                    .unwrap_or("unknown")
                    .to_owned(),
                details.column_name().unwrap_or("unknown").to_owned(),
            )
        }
        DieselError::NotFound => IngestError::NotFound("row".to_owned(), "unknown".to_owned()),
        _ => IngestError::Store(message),
    }
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGE_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ERROR: could not serialize access due to concurrent update", true)]
    #[case("ERROR: deadlock detected", true)]
    #[case("ERROR: duplicate key value violates unique constraint", false)]
    #[case("ERROR: column \"foo\" does not exist", false)]
    fn classifies_transient_messages(#[case] message: &str, #[case] expect_transient: bool) {
        assert_eq!(is_transient_message(message), expect_transient);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert!(is_transient_message("DEADLOCK DETECTED"));
    }
}
