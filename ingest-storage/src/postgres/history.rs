//! History transition (§4.3) — the heart of the engine.
//!
//! One pass materialises the primary keys affected by this snapshot into a
//! temp table, then runs, in order: close prior open versions, append new
//! insert/update versions (idempotent by construction), and emit delete
//! tombstones carrying the most-recent pre-delete payload forward.

use diesel::sql_query;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::ScdConfig;
use ingest_core::error::IngestError;
use ingest_core::models::ChangeOp;
use uuid::Uuid;

use super::delta::DeltaCounts;
use super::joins::null_safe_key_join;
use super::sql_ident::checked;
use super::staging::StagingNames;
use super::SnapshotStore;

/// Name of the temp table holding the union of affected primary keys for one
/// transition, random-suffixed like `StagingNames` (§4.3).
#[derive(Debug, Clone)]
pub struct AffectedKeysTable {
    pub name: String,
}

impl AffectedKeysTable {
    pub fn derive(base: &str) -> Self {
        let suffix = &Uuid::new_v4().simple().to_string()[..12];
        AffectedKeysTable { name: format!("aff_{base}_{suffix}") }
    }
}

fn pk_column_defs(cfg: &ScdConfig) -> Result<String, IngestError> {
    cfg.primary_key_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{name} {}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()
        .map(|defs| defs.join(", "))
}

fn pk_column_names(cfg: &ScdConfig) -> Result<String, IngestError> {
    cfg.primary_key_columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()
        .map(|names| names.join(", "))
}

/// Builds the affected-keys temp table: the union of insert keys, update
/// keys, and (when configured) delete keys — one SELECT per non-empty
/// bucket, per §4.3. Returns without populating anything (and thus without
/// running the rest of the transition) when every bucket is empty.
pub async fn build_affected_keys(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    table: &AffectedKeysTable,
    staging: &StagingNames,
    cfg: &ScdConfig,
    counts: &DeltaCounts,
) -> Result<(), IngestError> {
    let name = checked(&table.name)?;
    let pk_defs = pk_column_defs(cfg)?;
    let create_sql = format!("CREATE TEMP TABLE {name} ({pk_defs}) ON COMMIT DROP");
    sql_query(create_sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    let typed = checked(&staging.typed)?;
    let current = store.qualify(checked(&cfg.current_table())?);
    let pk_names = pk_column_names(cfg)?;
    let join = null_safe_key_join(&cfg.primary_key_columns, "s", "c")?;

    let mut branches = Vec::new();
    if counts.inserts > 0 {
        branches.push(format!(
            "SELECT {pk_sel} FROM {typed} s WHERE NOT EXISTS (SELECT 1 FROM {current} c WHERE {join})",
            pk_sel = select_list(&cfg.primary_key_columns, "s")?
        ));
    }
    if counts.updates > 0 {
        branches.push(format!(
            "SELECT {pk_sel} FROM {typed} s JOIN {current} c ON {join} WHERE s.row_hash <> c.row_hash",
            pk_sel = select_list(&cfg.primary_key_columns, "s")?
        ));
    }
    if counts.deletes > 0 {
        branches.push(format!(
            "SELECT {pk_names} FROM {current} c WHERE NOT EXISTS (SELECT 1 FROM {typed} s WHERE {join})"
        ));
    }

    if branches.is_empty() {
        return Ok(());
    }

    let insert_sql = format!("INSERT INTO {name} ({pk_names}) {}", branches.join(" UNION "));
    sql_query(insert_sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    Ok(())
}

fn select_list(pk_columns: &[ingest_core::models::ColumnSpec], alias: &str) -> Result<String, IngestError> {
    pk_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("{alias}.{name}::{} AS {name}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()
        .map(|cols| cols.join(", "))
}

/// Step 1: closes every open history version for an affected key
/// (§4.3 step 1). Also closes a lingering delete tombstone when the key is
/// reappearing (§4.3.1).
pub async fn close_prior_open_versions(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    affected: &AffectedKeysTable,
    cfg: &ScdConfig,
) -> Result<u64, IngestError> {
    let affected_name = checked(&affected.name)?;
    let history = store.qualify(checked(&cfg.history_table())?);
    let join = super::joins::null_safe_key_join_typed(&cfg.primary_key_columns, "h", "a")?;

    let sql = format!(
        "UPDATE {history} h SET valid_to = $1 \
         WHERE h.valid_to IS NULL AND EXISTS (SELECT 1 FROM {affected_name} a WHERE {join})"
    );
    diesel::sql_query(sql)
        .bind::<diesel::sql_types::Timestamp, _>(cfg.snapshot_ts)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Step 2+3: appends new insert/update versions from typed staging, guarded
/// by the two NOT-EXISTS idempotency clauses from §4.3 step 3.
pub async fn append_new_versions(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    staging: &StagingNames,
    cfg: &ScdConfig,
) -> Result<u64, IngestError> {
    let typed = checked(&staging.typed)?;
    let current = store.qualify(checked(&cfg.current_table())?);
    let history = store.qualify(checked(&cfg.history_table())?);
    let pk_names = pk_column_names(cfg)?;
    let payload_names = cfg
        .payload_columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let pk_select = select_list(&cfg.primary_key_columns, "s")?;
    let payload_select = cfg
        .payload_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("s.{name}::{} AS {name}", c.sql_type)))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let join_s_c = null_safe_key_join(&cfg.primary_key_columns, "s", "c")?;
    let join_s_c2 = null_safe_key_join(&cfg.primary_key_columns, "s", "c2")?;
    let join_s_h2 = null_safe_key_join(&cfg.primary_key_columns, "s", "h2")?;

    let sql = format!(
        "INSERT INTO {history} ({pk_names}, {payload_names}, valid_from, valid_to, row_hash, op, run_id) \
         SELECT {pk_select}, {payload_select}, $1, NULL, s.row_hash, \
         CASE WHEN EXISTS (SELECT 1 FROM {current} c WHERE {join_s_c}) THEN '{update_op}' ELSE '{insert_op}' END, $2 \
         FROM {typed} s \
         WHERE NOT EXISTS (SELECT 1 FROM {current} c2 WHERE {join_s_c2} AND c2.row_hash = s.row_hash) \
         AND NOT EXISTS (SELECT 1 FROM {history} h2 WHERE {join_s_h2} AND h2.row_hash = s.row_hash AND h2.valid_from = $1)",
        update_op = ChangeOp::Update.as_sql_char(),
        insert_op = ChangeOp::Insert.as_sql_char(),
    );

    diesel::sql_query(sql)
        .bind::<diesel::sql_types::Timestamp, _>(cfg.snapshot_ts)
        .bind::<diesel::sql_types::Text, _>(cfg.run_id.clone())
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Step 4: emits a delete tombstone for every key present in `current` but
/// absent from staging, carrying the payload and `row_hash` of the version
/// just closed at `snapshot_ts` with the greatest `valid_from` (§4.3 step 4,
/// §4.3.2). A no-op unless `cfg.missing_means_deleted` is set.
pub async fn emit_delete_tombstones(
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
    let history = store.qualify(checked(&cfg.history_table())?);
    let pk_names = pk_column_names(cfg)?;
    let payload_names = cfg
        .payload_columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let join_c_s = null_safe_key_join(&cfg.primary_key_columns, "s", "c")?;
    let join_hh_c = super::joins::null_safe_key_join_typed(&cfg.primary_key_columns, "hh", "c")?;
    let pk_select_h = cfg
        .primary_key_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("h.{name}")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let payload_select_h = cfg
        .payload_columns
        .iter()
        .map(|c| checked(&c.name).map(|name| format!("h.{name}")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let sql = format!(
        "INSERT INTO {history} ({pk_names}, {payload_names}, valid_from, valid_to, row_hash, op, run_id) \
         SELECT {pk_select_h}, {payload_select_h}, $1, NULL, h.row_hash, '{delete_op}', $2 \
         FROM {current} c \
         JOIN LATERAL ( \
           SELECT * FROM {history} hh \
           WHERE hh.valid_to = $1 AND {join_hh_c} \
           ORDER BY hh.valid_from DESC LIMIT 1 \
         ) h ON true \
         WHERE NOT EXISTS (SELECT 1 FROM {typed} s WHERE {join_c_s})",
        delete_op = ChangeOp::Delete.as_sql_char(),
    );

    diesel::sql_query(sql)
        .bind::<diesel::sql_types::Timestamp, _>(cfg.snapshot_ts)
        .bind::<diesel::sql_types::Text, _>(cfg.run_id.clone())
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Runs the full §4.3 transition: build affected keys, close prior versions,
/// append new versions, emit tombstones. A no-op (returns immediately) when
/// `counts` has no inserts, updates, or deletes — the §4.3.3 empty-snapshot
/// case when `missing_means_deleted` is unset.
pub async fn transition(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    staging: &StagingNames,
    cfg: &ScdConfig,
    counts: &DeltaCounts,
) -> Result<(), IngestError> {
    if counts.inserts == 0 && counts.updates == 0 && counts.deletes == 0 {
        return Ok(());
    }

    let affected = AffectedKeysTable::derive(&cfg.table_base_name);
    build_affected_keys(conn, store, &affected, staging, cfg, counts).await?;
    close_prior_open_versions(conn, store, &affected, cfg).await?;
    append_new_versions(conn, store, staging, cfg).await?;
    emit_delete_tombstones(conn, store, staging, cfg).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::models::ColumnSpec;

    #[test]
    fn affected_keys_table_names_are_unique_and_prefixed() {
        let a = AffectedKeysTable::derive("e1");
        let b = AffectedKeysTable::derive("e1");
        assert_ne!(a.name, b.name);
        assert!(a.name.starts_with("aff_e1_"));
    }

    #[test]
    fn select_list_casts_to_declared_sql_type() {
        let cols = vec![ColumnSpec::new("id", "INTEGER")];
        let sel = select_list(&cols, "s").unwrap();
        assert_eq!(sel, "s.id::INTEGER AS id");
    }

    #[test]
    fn pk_column_defs_joins_name_and_type() {
        use chrono::NaiveDate;
        let cfg = ScdConfig::new(
            "e1",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            vec![ColumnSpec::new("id", "INTEGER"), ColumnSpec::new("region", "VARCHAR")],
            vec![ColumnSpec::new("name", "VARCHAR")],
        );
        assert_eq!(pk_column_defs(&cfg).unwrap(), "id INTEGER, region VARCHAR");
        assert_eq!(pk_column_names(&cfg).unwrap(), "id, region");
    }
}
