//! Fact append (§4.5).
//!
//! Simpler than the SCD2 path: no history, no dedup against existing rows —
//! identity is `(time, configured keys...)` and every append is a plain
//! bulk insert. The one complication is the optional credits-delta column,
//! computed for a whole batch in one batched query via a lateral join to
//! each key's latest existing row, rather than per row.

use diesel::sql_query;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::FactConfig;
use ingest_core::error::IngestError;
use ingest_core::models::column::ColumnSpec;
use ingest_core::view::RowSource;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sql_ident::checked;
use super::staging::write_snapshot_csv;
use super::SnapshotStore;

fn column_spec<'a>(columns: &'a [ColumnSpec], name: &str) -> Result<&'a ColumnSpec, IngestError> {
    columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| IngestError::Validation(format!("column {name:?} is not declared")))
}

/// Creates `<table_name>_raw` if absent, with every declared column at its
/// declared SQL type. Time partitioning (if configured) is delegated to
/// `super::partition`.
pub async fn create_fact_table(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    cfg: &FactConfig,
) -> Result<(), IngestError> {
    let table = store.qualify(checked(&cfg.raw_table())?);
    let column_defs = cfg
        .columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name} {}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let sql = format!("CREATE TABLE IF NOT EXISTS {table} ({column_defs})");
    sql_query(sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    if cfg.partition_by_time {
        super::partition::ensure_fact_partitioning(conn, store, cfg).await?;
    }

    Ok(())
}

/// Streams `source`'s rows into a scoped CSV, loads them into a per-append
/// temp staging table, computes `credits_delta` when configured, and inserts
/// the result into the raw fact table — all inside the caller's transaction.
pub async fn append_facts(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    source: &(dyn RowSource + '_),
    cfg: &FactConfig,
    cancellation: &CancellationToken,
) -> Result<u64, IngestError> {
    let file = write_snapshot_csv(source, &cfg.columns, cancellation).await?;

    let suffix = &Uuid::new_v4().simple().to_string()[..12];
    let stage_table = format!("stg_fact_{}_{suffix}", cfg.table_name);
    let stage = checked(&stage_table)?;

    let column_defs = cfg
        .columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name} TEXT")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    sql_query(format!("CREATE TEMP TABLE {stage} ({column_defs}) ON COMMIT DROP"))
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    let path_str = file
        .path()
        .to_str()
        .ok_or_else(|| IngestError::Load("fact staging csv path is not valid UTF-8".into()))?;
    if path_str.contains('\'') {
        return Err(IngestError::Load(
            "fact staging csv path must not contain a single quote".into(),
        ));
    }
    sql_query(format!("COPY {stage} FROM '{path_str}' (FORMAT CSV, HEADER false)"))
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    match &cfg.credits_delta {
        Some(spec) => insert_with_credits_delta(conn, store, stage, cfg, spec).await,
        None => insert_plain(conn, store, stage, cfg).await,
    }
}

async fn insert_plain(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    stage: &str,
    cfg: &FactConfig,
) -> Result<u64, IngestError> {
    let table = store.qualify(checked(&cfg.raw_table())?);
    let column_names = cfg
        .columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name}::{}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let plain_names = cfg
        .columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let sql = format!("INSERT INTO {table} ({plain_names}) SELECT {column_names} FROM {stage}");
    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Inserts staged rows into the raw table, computing `output_column` under
/// the three-rule credits-delta policy (§4.5) via one lateral join per key
/// to that key's latest existing row.
async fn insert_with_credits_delta(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    stage: &str,
    cfg: &FactConfig,
    spec: &ingest_core::config::CreditsDeltaSpec,
) -> Result<u64, IngestError> {
    let table = store.qualify(checked(&cfg.raw_table())?);
    let epoch = column_spec(&cfg.columns, &spec.epoch_column)?;
    let credits = column_spec(&cfg.columns, &spec.credits_column)?;
    let output = checked(&spec.output_column)?;
    let epoch_name = checked(&epoch.name)?;
    let credits_name = checked(&credits.name)?;

    let key_join = spec
        .key_columns
        .iter()
        .map(|k| {
            let col = column_spec(&cfg.columns, k)?;
            let name = checked(&col.name)?;
            Ok::<_, IngestError>(format!(
                "f.{name} = stg.{name}::{sql_type}",
                sql_type = col.sql_type
            ))
        })
        .collect::<Result<Vec<_>, _>>()?
        .join(" AND ");

    let insert_columns = cfg
        .columns
        .iter()
        .filter(|c| c.name != spec.output_column)
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let select_columns = cfg
        .columns
        .iter()
        .filter(|c| c.name != spec.output_column)
        .map(|c| checked(&c.name).map(|name| format!("stg.{name}::{}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let sql = format!(
        "INSERT INTO {table} ({insert_columns}, {output}) \
         SELECT {select_columns}, \
           CASE \
             WHEN prev.prev_epoch IS NULL THEN NULL \
             WHEN stg.{epoch_name}::{epoch_type} = prev.prev_epoch THEN GREATEST(stg.{credits_name}::{credits_type} - prev.prev_credits, 0) \
             WHEN stg.{epoch_name}::{epoch_type} = prev.prev_epoch + 1 THEN NULL \
             ELSE NULL \
           END AS {output} \
         FROM {stage} stg \
         LEFT JOIN LATERAL ( \
           SELECT f.{epoch_name} AS prev_epoch, f.{credits_name} AS prev_credits \
           FROM {table} f \
           WHERE {key_join} \
           ORDER BY f.{epoch_name} DESC \
           LIMIT 1 \
         ) prev ON true",
        epoch_type = epoch.sql_type,
        credits_type = credits.sql_type,
    );

    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("validator", "VARCHAR"),
            ColumnSpec::new("epoch", "BIGINT"),
            ColumnSpec::new("credits", "BIGINT"),
            ColumnSpec::new("credits_delta", "BIGINT"),
        ]
    }

    #[test]
    fn column_spec_finds_declared_column() {
        let found = column_spec(&cols(), "epoch").unwrap();
        assert_eq!(found.sql_type, "BIGINT");
    }

    #[test]
    fn column_spec_rejects_missing_column() {
        assert!(column_spec(&cols(), "nonexistent").is_err());
    }
}
