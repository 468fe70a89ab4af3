//! Repair procedures (§4.3.4, §4.6).
//!
//! Read-repair operations that correct data written by earlier, buggier
//! transitions. All three support dry-run (report what would change without
//! changing anything) and are meant to be run interactively by an operator,
//! not on every ingestion.

use diesel::sql_query;
use diesel::sql_types::BigInt;
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::ScdConfig;
use ingest_core::error::IngestError;
use ingest_core::models::ChangeOp;
use uuid::Uuid;

use super::sql_ident::checked;
use super::SnapshotStore;

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

async fn scalar_count(conn: &mut AsyncPgConnection, sql: String) -> Result<u64, IngestError> {
    let row: CountRow = sql_query(sql)
        .get_result(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;
    Ok(row.count.max(0) as u64)
}

/// Backfill `valid_to` on deletes (§4.3.4): finds open rows where a later
/// `op = 'D'` row exists for the same key, and sets `valid_to` to the
/// earliest such delete's `valid_from`. Returns the number of rows affected
/// (or that would be affected, when `dry_run` is set).
pub async fn backfill_valid_to_on_deletes(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    cfg: &ScdConfig,
    dry_run: bool,
) -> Result<u64, IngestError> {
    let history = store.qualify(checked(&cfg.history_table())?);
    let pk_join = super::joins::null_safe_key_join_typed(&cfg.primary_key_columns, "h", "d")?;
    let delete_op = ChangeOp::Delete.as_sql_char();

    if dry_run {
        let sql = format!(
            "SELECT count(*) AS count FROM {history} h WHERE h.valid_to IS NULL \
             AND EXISTS (SELECT 1 FROM {history} d WHERE d.op = '{delete_op}' AND {pk_join} AND d.valid_from > h.valid_from)"
        );
        return scalar_count(conn, sql).await;
    }

    let sql = format!(
        "UPDATE {history} h SET valid_to = ( \
           SELECT MIN(d.valid_from) FROM {history} d \
           WHERE d.op = '{delete_op}' AND {pk_join} AND d.valid_from > h.valid_from \
         ) \
         WHERE h.valid_to IS NULL \
         AND EXISTS (SELECT 1 FROM {history} d WHERE d.op = '{delete_op}' AND {pk_join} AND d.valid_from > h.valid_from)"
    );
    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Backfill `valid_to` on re-inserts (§4.3.4): finds open `op = 'D'` rows
/// where a later `op IN ('I','U')` row exists for the same key, and sets
/// `valid_to` to the earliest such re-insert's `valid_from`.
pub async fn backfill_valid_to_on_reinserts(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    cfg: &ScdConfig,
    dry_run: bool,
) -> Result<u64, IngestError> {
    let history = store.qualify(checked(&cfg.history_table())?);
    let pk_join = super::joins::null_safe_key_join_typed(&cfg.primary_key_columns, "h", "r")?;
    let delete_op = ChangeOp::Delete.as_sql_char();
    let live_ops = format!("'{}','{}'", ChangeOp::Insert.as_sql_char(), ChangeOp::Update.as_sql_char());

    if dry_run {
        let sql = format!(
            "SELECT count(*) AS count FROM {history} h WHERE h.op = '{delete_op}' AND h.valid_to IS NULL \
             AND EXISTS (SELECT 1 FROM {history} r WHERE r.op IN ({live_ops}) AND {pk_join} AND r.valid_from > h.valid_from)"
        );
        return scalar_count(conn, sql).await;
    }

    let sql = format!(
        "UPDATE {history} h SET valid_to = ( \
           SELECT MIN(r.valid_from) FROM {history} r \
           WHERE r.op IN ({live_ops}) AND {pk_join} AND r.valid_from > h.valid_from \
         ) \
         WHERE h.op = '{delete_op}' AND h.valid_to IS NULL \
         AND EXISTS (SELECT 1 FROM {history} r WHERE r.op IN ({live_ops}) AND {pk_join} AND r.valid_from > h.valid_from)"
    );
    sql_query(sql)
        .execute(conn)
        .await
        .map(|n| n as u64)
        .map_err(|err| super::error::PostgresError::from(err).0)
}

/// Deduplicates `current` (§4.6): keeps exactly one row per primary key —
/// the one with greatest `as_of_ts`, tiebroken by greatest `row_hash` — by
/// building a deduplicated temp table, then clearing and reinserting
/// `current` from it. Row-predicate deletion can't discriminate
/// byte-identical duplicates, so "clear and reinsert" is used instead of a
/// targeted `DELETE`.
pub async fn deduplicate_current(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    cfg: &ScdConfig,
    dry_run: bool,
) -> Result<u64, IngestError> {
    let current = store.qualify(checked(&cfg.current_table())?);
    let pk_names = cfg
        .primary_key_columns
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let all_names = cfg
        .all_columns()
        .iter()
        .map(|c| checked(&c.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let total_sql = format!("SELECT count(*) AS count FROM {current}");
    let total = scalar_count(conn, total_sql).await?;
    let unique_sql = format!("SELECT count(DISTINCT ({pk_names})) AS count FROM {current}");
    let unique = scalar_count(conn, unique_sql).await?;
    let duplicate_count = total.saturating_sub(unique);

    if dry_run || duplicate_count == 0 {
        return Ok(duplicate_count);
    }

    let suffix = &Uuid::new_v4().simple().to_string()[..12];
    let dedup_table = checked(&format!("dedup_{}_{suffix}", cfg.table_base_name))?.to_string();

    let create_sql = format!(
        "CREATE TEMP TABLE {dedup_table} AS \
         SELECT {all_names}, as_of_ts, row_hash FROM ( \
           SELECT {all_names}, as_of_ts, row_hash, \
             ROW_NUMBER() OVER (PARTITION BY {pk_names} ORDER BY as_of_ts DESC, row_hash DESC) AS rn \
           FROM {current} \
         ) ranked WHERE rn = 1"
    );
    sql_query(create_sql)
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    sql_query(format!("DELETE FROM {current}"))
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    sql_query(format!(
        "INSERT INTO {current} ({all_names}, as_of_ts, row_hash) SELECT {all_names}, as_of_ts, row_hash FROM {dedup_table}"
    ))
    .execute(conn)
    .await
    .map_err(|err| super::error::PostgresError::from(err).0)?;

    sql_query(format!("DROP TABLE {dedup_table}"))
        .execute(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;

    Ok(duplicate_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_count_saturates_when_unique_exceeds_total() {
        // defensive: should never happen, but saturating_sub must not panic or wrap.
        assert_eq!(5u64.saturating_sub(7), 0);
    }
}
