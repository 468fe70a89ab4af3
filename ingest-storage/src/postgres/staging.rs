//! Staging (§4.1).
//!
//! Two steps: first the view's snapshot is streamed to a scoped CSV temp
//! file (`write_snapshot_csv`, outside any transaction — cancellation-aware,
//! discarded on any failure); then, inside the ingestion's transaction, two
//! temp tables are built from that file: a raw, all-text staging table
//! loaded by `COPY`, and a typed staging table with the computed `row_hash`
//! and constant `snapshot_ts` (§3.1, §3.3). Both temp tables are declared
//! `ON COMMIT DROP` so they never outlive the transaction, matching the
//! teacher's "temp tables live only inside the transaction" rule (§5).

use diesel::sql_query;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::ScdConfig;
use ingest_core::error::IngestError;
use ingest_core::models::column::ColumnSpec;
use ingest_core::view::{Row, RowSource};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::sql_ident::checked;

/// Names of the two temp tables backing one ingestion, derived from the
/// entity's base name plus a random suffix so concurrent ingestions (of
/// different entities, or retried attempts of the same one) never collide
/// (§6.3).
#[derive(Debug, Clone)]
pub struct StagingNames {
    pub raw: String,
    pub typed: String,
}

impl StagingNames {
    pub fn derive(base: &str) -> Self {
        let suffix = &Uuid::new_v4().simple().to_string()[..12];
        StagingNames {
            raw: format!("stg_raw_{base}_{suffix}"),
            typed: format!("stg_typed_{base}_{suffix}"),
        }
    }
}

/// Streams `source`'s snapshot into a new scoped temp CSV file, flushed and
/// fsynced before returning. Checks `cancellation` before writing each row;
/// on cancellation, a producer error, or an I/O error the temp file is
/// dropped (and so removed from disk) without ever being handed to a
/// transaction.
pub async fn write_snapshot_csv(
    source: &(dyn RowSource + '_),
    columns: &[ColumnSpec],
    cancellation: &CancellationToken,
) -> Result<NamedTempFile, IngestError> {
    let file = tempfile::Builder::new()
        .prefix("ingest-staging-")
        .suffix(".csv")
        .tempfile()
        .map_err(|err| IngestError::Load(format!("failed to create staging temp file: {err}")))?;

    let n = source.row_count();
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file.as_file());

        let mut row: Row = Vec::with_capacity(columns.len());
        for i in 0..n {
            if cancellation.is_cancelled() {
                return Err(IngestError::cancelled(
                    "context cancelled during staging write",
                    None,
                ));
            }

            row.clear();
            source
                .write_row(i, &mut row)
                .await
                .map_err(|err| IngestError::Producer(err.to_string()))?;

            if row.len() != columns.len() {
                return Err(IngestError::Producer(format!(
                    "row {i} produced {} fields, expected {}",
                    row.len(),
                    columns.len()
                )));
            }

            writer
                .write_record(row.iter())
                .map_err(|err| IngestError::Load(format!("failed writing staging row {i}: {err}")))?;
        }

        writer
            .flush()
            .map_err(|err| IngestError::Load(format!("failed flushing staging csv: {err}")))?;
    }

    file.as_file()
        .sync_all()
        .map_err(|err| IngestError::Load(format!("failed to fsync staging csv: {err}")))?;

    debug!(rows = n, path = ?file.path(), "wrote staging csv");
    Ok(file)
}

/// Creates the raw staging table: every declared column as `TEXT`, loaded
/// verbatim from the CSV. Letting the store coerce types later, at
/// INSERT-into-current time, keeps this path schema-agnostic and centralises
/// type errors at a single boundary (§4.1, §9).
pub async fn create_raw_staging(
    conn: &mut AsyncPgConnection,
    names: &StagingNames,
    columns: &[ColumnSpec],
) -> Result<(), IngestError> {
    let table = checked(&names.raw)?;
    let column_defs = columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name} TEXT")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let sql = format!("CREATE TEMP TABLE {table} ({column_defs}) ON COMMIT DROP");
    sql_query(sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;
    Ok(())
}

/// Loads `path` into the raw staging table via a server-side `COPY`. The
/// path is rejected (rather than escaped) if it contains a single quote,
/// since there is no legitimate reason a scoped temp file path would.
pub async fn copy_csv_into_raw_staging(
    conn: &mut AsyncPgConnection,
    names: &StagingNames,
    path: &Path,
) -> Result<u64, IngestError> {
    let table = checked(&names.raw)?;
    let path_str = path
        .to_str()
        .ok_or_else(|| IngestError::Load("staging csv path is not valid UTF-8".into()))?;
    if path_str.contains('\'') {
        return Err(IngestError::Load(
            "staging csv path must not contain a single quote".into(),
        ));
    }

    let sql = format!("COPY {table} FROM '{path_str}' (FORMAT CSV, HEADER false)");
    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// The NULL-safe `row_hash` SQL expression over `payload_columns`, in
/// declared order: `md5(coalesce(c1,'') || '|' || coalesce(c2,'') || ...)`.
/// Identical on both sides of every comparison, stable across reruns, and
/// NULL-safe by construction (§4.1, §9).
pub fn row_hash_expr(payload_columns: &[ColumnSpec]) -> Result<String, IngestError> {
    if payload_columns.is_empty() {
        return Err(IngestError::Validation(
            "row_hash requires at least one payload column".into(),
        ));
    }
    let joined = payload_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("coalesce({name}, '')")))
        .collect::<Result<Vec<_>, _>>()?
        .join(" || '|' || ");
    Ok(format!("md5({joined})"))
}

/// Creates the typed staging table (primary-key and payload columns still as
/// `TEXT`, deliberately — lexicographic comparison suffices for key matching
/// and hashing) and populates it from the raw staging table, adding the
/// constant `snapshot_ts` and the computed `row_hash` (§4.1).
pub async fn create_typed_staging(
    conn: &mut AsyncPgConnection,
    names: &StagingNames,
    cfg: &ScdConfig,
) -> Result<(), IngestError> {
    let raw = checked(&names.raw)?;
    let typed = checked(&names.typed)?;

    let all_columns: Vec<&ColumnSpec> = cfg.all_columns();
    let column_defs = all_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name} TEXT")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let column_names = all_columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let row_hash = row_hash_expr(&cfg.payload_columns)?;

    let create_sql = format!(
        "CREATE TEMP TABLE {typed} ({column_defs}, snapshot_ts TIMESTAMP NOT NULL, row_hash TEXT NOT NULL) ON COMMIT DROP"
    );
    sql_query(create_sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    let insert_sql = format!(
        "INSERT INTO {typed} ({column_names}, snapshot_ts, row_hash) \
         SELECT {column_names}, $1::timestamp, {row_hash} FROM {raw}"
    );
    diesel::sql_query(insert_sql)
        .bind::<diesel::sql_types::Timestamp, _>(cfg.snapshot_ts)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    debug!(raw = %names.raw, typed = %names.typed, "populated typed staging table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::error::IngestError as CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Rows(Vec<Row>);

    #[async_trait::async_trait]
    impl RowSource for Rows {
        fn row_count(&self) -> usize {
            self.0.len()
        }
        async fn write_row(&self, index: usize, row: &mut Row) -> Result<(), CoreError> {
            row.clone_from(&self.0[index]);
            Ok(())
        }
    }

    struct FailingAt(usize, AtomicUsize);

    #[async_trait::async_trait]
    impl RowSource for FailingAt {
        fn row_count(&self) -> usize {
            5
        }
        async fn write_row(&self, index: usize, row: &mut Row) -> Result<(), CoreError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            if index == self.0 {
                return Err(CoreError::Producer("boom".into()));
            }
            row.clear();
            row.push(index.to_string());
            Ok(())
        }
    }

    fn cols() -> Vec<ColumnSpec> {
        vec![ColumnSpec::new("id", "VARCHAR")]
    }

    #[tokio::test]
    async fn writes_csv_rows_in_order() {
        let source = Rows(vec![
            vec!["1".into(), "Alice".into()],
            vec!["2".into(), "Bob".into()],
        ]);
        let columns = vec![ColumnSpec::new("id", "VARCHAR"), ColumnSpec::new("name", "VARCHAR")];
        let token = CancellationToken::new();
        let file = write_snapshot_csv(&source, &columns, &token).await.unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "1,Alice\n2,Bob\n");
    }

    #[tokio::test]
    async fn producer_error_is_surfaced_and_file_is_not_usable() {
        let source = FailingAt(2, AtomicUsize::new(0));
        let token = CancellationToken::new();
        let result = write_snapshot_csv(&source, &cols(), &token).await;
        assert!(matches!(result, Err(CoreError::Producer(_))));
        // rows before the failure were attempted, rows after were not
        assert_eq!(source.1.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_each_row() {
        let source = Rows(vec![vec!["1".into()]; 10]);
        let token = CancellationToken::new();
        token.cancel();
        let result = write_snapshot_csv(&source, &cols(), &token).await;
        assert!(matches!(result, Err(CoreError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn mismatched_field_count_is_a_producer_error() {
        struct Bad;
        #[async_trait::async_trait]
        impl RowSource for Bad {
            fn row_count(&self) -> usize {
                1
            }
            async fn write_row(&self, _index: usize, row: &mut Row) -> Result<(), CoreError> {
                row.push("only one field".into());
                row.push("but two columns expected".into());
                Ok(())
            }
        }
        let columns = vec![ColumnSpec::new("id", "VARCHAR")];
        let token = CancellationToken::new();
        let result = write_snapshot_csv(&Bad, &columns, &token).await;
        assert!(matches!(result, Err(CoreError::Producer(_))));
    }

    #[test]
    fn row_hash_expr_is_null_safe_and_order_preserving() {
        let cols = vec![ColumnSpec::new("name", "VARCHAR"), ColumnSpec::new("age", "INTEGER")];
        let expr = row_hash_expr(&cols).unwrap();
        assert_eq!(expr, "md5(coalesce(name, '') || '|' || coalesce(age, ''))");
    }

    #[test]
    fn row_hash_expr_rejects_empty_payload() {
        assert!(row_hash_expr(&[]).is_err());
    }

    #[test]
    fn staging_names_are_unique_per_derivation() {
        let a = StagingNames::derive("e1");
        let b = StagingNames::derive("e1");
        assert_ne!(a.raw, b.raw);
        assert_ne!(a.typed, b.typed);
        assert!(a.raw.starts_with("stg_raw_e1_"));
        assert!(a.typed.starts_with("stg_typed_e1_"));
    }
}
