//! The engine → view contract (§6.2).
//!
//! A view is a thin collector: it polls some upstream source on a refresh
//! interval and, once per refresh, hands the engine a row count and a
//! callback that can produce any row of the snapshot on demand. The engine
//! drives this callback exactly `row_count()` times, in order, writing each
//! row straight to the staging CSV (§4.1) — it never buffers the whole
//! snapshot in memory.
//!
//! Both `SCDTable` and `InsertFacts` share this same shape in §6.2, so one
//! trait, [`RowSource`], serves both ingestion paths.

use crate::error::IngestError;
use async_trait::async_trait;

/// One row's worth of field values, in the declared column order (primary
/// key columns then payload columns for an SCD snapshot; declared column
/// order for a fact snapshot).
pub type Row = Vec<String>;

/// A snapshot a view hands to the engine.
///
/// Implementations should be cheap to construct and defer any expensive work
/// (e.g. RPC calls) to `write_row`, since `write_row` is the only method the
/// engine actually calls — and it is cancellation-checked between calls by
/// the staging writer (§4.1, §5).
#[async_trait]
pub trait RowSource: Send + Sync {
    /// The number of rows in this snapshot. Called once, before any
    /// `write_row` call.
    fn row_count(&self) -> usize;

    /// Writes row `index` (`0..row_count()`) into `row`, appending one field
    /// per declared column, in order. `row` is cleared by the caller before
    /// each call.
    ///
    /// An error here is a [`IngestError::Producer`] error: the engine
    /// discards the partially written staging file and returns immediately,
    /// without touching any table.
    async fn write_row(&self, index: usize, row: &mut Row) -> Result<(), IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countable {
        rows: Vec<Row>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RowSource for Countable {
        fn row_count(&self) -> usize {
            self.rows.len()
        }

        async fn write_row(&self, index: usize, row: &mut Row) -> Result<(), IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            row.clone_from(&self.rows[index]);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drives_callback_once_per_row_in_order() {
        let source = Countable {
            rows: vec![vec!["1".into()], vec!["2".into()], vec!["3".into()]],
            calls: AtomicUsize::new(0),
        };
        let mut row = Row::new();
        for i in 0..source.row_count() {
            source.write_row(i, &mut row).await.unwrap();
            assert_eq!(row, source.rows[i]);
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
