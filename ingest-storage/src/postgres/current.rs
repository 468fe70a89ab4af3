//! Current refresh (§4.4).
//!
//! A single `MERGE` drives `current` to exact staging state. Staging can in
//! principle contain duplicate primary keys (not an expected input, but a
//! diagnostic safety net — see §4.4), so it is deduplicated first by a
//! `ROW_NUMBER() OVER (PARTITION BY pk ORDER BY snapshot_ts DESC)` window,
//! keeping the most recent row per key.

use diesel::sql_query;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::ScdConfig;
use ingest_core::error::IngestError;

use super::joins::null_safe_key_join;
use super::sql_ident::checked;
use super::staging::StagingNames;
use super::SnapshotStore;

fn column_list(names: &[String]) -> String {
    names.join(", ")
}

fn checked_names<'a>(cols: impl Iterator<Item = &'a ingest_core::models::ColumnSpec>) -> Result<Vec<String>, IngestError> {
    cols.map(|c| checked(&c.name).map(|n| n.to_string())).collect()
}

/// Merges the (deduplicated) typed staging table into `current`: updates
/// matched rows' payload, `as_of_ts`, and `row_hash`; inserts unmatched rows.
/// Returns the number of rows affected by the MERGE.
pub async fn merge_into_current(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    staging: &StagingNames,
    cfg: &ScdConfig,
) -> Result<u64, IngestError> {
    let typed = checked(&staging.typed)?;
    let current = store.qualify(checked(&cfg.current_table())?);

    let pk_names = checked_names(cfg.primary_key_columns.iter())?;
    let payload_names = checked_names(cfg.payload_columns.iter())?;
    let pk_list = column_list(&pk_names);
    let payload_list = column_list(&payload_names);

    let join_c_d = null_safe_key_join(&cfg.primary_key_columns, "d", "c")?;
    let update_set = payload_names
        .iter()
        .map(|n| format!("{n} = d.{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_columns = format!("{pk_list}, {payload_list}, as_of_ts, row_hash");
    let insert_values = pk_names
        .iter()
        .chain(payload_names.iter())
        .map(|n| format!("d.{n}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "WITH dedup AS ( \
           SELECT {pk_list}, {payload_list}, snapshot_ts, row_hash, \
             ROW_NUMBER() OVER (PARTITION BY {pk_list} ORDER BY snapshot_ts DESC) AS rn \
           FROM {typed} \
         ) \
         MERGE INTO {current} AS c \
         USING (SELECT * FROM dedup WHERE rn = 1) AS d \
         ON ({join_c_d}) \
         WHEN MATCHED THEN UPDATE SET {update_set}, as_of_ts = d.snapshot_ts, row_hash = d.row_hash \
         WHEN NOT MATCHED THEN INSERT ({insert_columns}) VALUES ({insert_values}, d.snapshot_ts, d.row_hash)"
    );

    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Deletes `current` rows whose primary key is absent from typed staging.
/// A no-op unless `cfg.missing_means_deleted` is set (§4.4).
pub async fn delete_missing_from_current(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    staging: &StagingNames,
    cfg: &ScdConfig,
) -> Result<u64, IngestError> {
    if !cfg.missing_means_deleted {
        return Ok(0);
    }

    let typed = checked(&staging.typed)?;
    let current = store.qualify(checked(&cfg.current_table())?);
    let join = null_safe_key_join(&cfg.primary_key_columns, "s", "c")?;

    let sql = format!(
        "DELETE FROM {current} c WHERE NOT EXISTS (SELECT 1 FROM {typed} s WHERE {join})"
    );
    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Runs the full §4.4 refresh: merge then (optionally) delete.
pub async fn refresh_current(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    staging: &StagingNames,
    cfg: &ScdConfig,
) -> Result<(), IngestError> {
    merge_into_current(conn, store, staging, cfg).await?;
    delete_missing_from_current(conn, store, staging, cfg).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::models::ColumnSpec;

    #[test]
    fn column_list_joins_with_comma() {
        assert_eq!(column_list(&["a".into(), "b".into()]), "a, b");
    }

    #[test]
    fn checked_names_rejects_unsafe_identifiers() {
        let cols = vec![ColumnSpec::new("ok", "TEXT"), ColumnSpec::new("bad; drop", "TEXT")];
        assert!(checked_names(cols.iter()).is_err());
    }

    #[test]
    fn checked_names_preserves_declared_order() {
        let cols = vec![ColumnSpec::new("b", "TEXT"), ColumnSpec::new("a", "TEXT")];
        assert_eq!(checked_names(cols.iter()).unwrap(), vec!["b", "a"]);
    }
}
