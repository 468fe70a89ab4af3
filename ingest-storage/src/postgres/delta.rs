//! Delta computation (§4.2).
//!
//! All primary-key joins use NULL-safe equality (`IS NOT DISTINCT FROM`
//! across every primary-key column, conjoined), since a NULL-valued primary
//! key is a valid identity and ordinary `=` would silently drop it from every
//! join. The typed staging table carries primary-key columns as `TEXT`
//! (§4.1), so every join against it casts the staging side to the column's
//! declared SQL type; see `super::joins`.

use diesel::sql_types::BigInt;
use diesel::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use ingest_core::config::ScdConfig;
use ingest_core::error::IngestError;
use tracing::warn;

use super::joins::null_safe_key_join;
use super::sql_ident::checked;
use super::staging::StagingNames;
use super::SnapshotStore;

/// Insert/update/delete counts for one snapshot against `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

async fn scalar_count(conn: &mut AsyncPgConnection, sql: String) -> Result<u64, IngestError> {
    let row: CountRow = diesel::sql_query(sql)
        .get_result(conn)
        .await
        .map_err(|err| super::error::PostgresError::from(err).0)?;
    Ok(row.count.max(0) as u64)
}

/// Computes inserts/updates/deletes for the typed staging table named in
/// `names` against `cfg.current_table()`. `deletes` is always zero unless
/// `cfg.missing_means_deleted` is set (§4.2).
pub async fn compute_delta(
    conn: &mut AsyncPgConnection,
    store: &SnapshotStore,
    names: &StagingNames,
    cfg: &ScdConfig,
) -> Result<DeltaCounts, IngestError> {
    let typed = checked(&names.typed)?;
    let current = store.qualify(checked(&cfg.current_table())?);

    let join_s_c = null_safe_key_join(&cfg.primary_key_columns, "s", "c")?;

    let inserts_sql = format!(
        "SELECT count(*) AS count FROM {typed} s WHERE NOT EXISTS \
         (SELECT 1 FROM {current} c WHERE {join_s_c})"
    );
    let inserts = scalar_count(conn, inserts_sql).await?;

    let updates_sql = format!(
        "SELECT count(*) AS count FROM {typed} s JOIN {current} c ON {join_s_c} \
         WHERE s.row_hash <> c.row_hash"
    );
    let updates = scalar_count(conn, updates_sql).await?;

    let deletes = if cfg.missing_means_deleted {
        let deletes_sql = format!(
            "SELECT count(*) AS count FROM {current} c WHERE NOT EXISTS \
             (SELECT 1 FROM {typed} s WHERE {join_s_c})"
        );
        scalar_count(conn, deletes_sql).await?
    } else {
        0
    };

    let current_count_sql = format!("SELECT count(*) AS count FROM {current}");
    let current_count = scalar_count(conn, current_count_sql).await?;
    let staging_count_sql = format!("SELECT count(*) AS count FROM {typed}");
    let staging_count = scalar_count(conn, staging_count_sql).await?;

    let counts = DeltaCounts { inserts, updates, deletes };
    sanity_check(&counts, current_count, staging_count);
    Ok(counts)
}

/// Logs a warning when the computed counts violate the invariants that a
/// correct NULL-safe join must preserve (§4.2). Never fails the ingestion;
/// a violation here means the join lost NULL semantics somewhere upstream.
fn sanity_check(counts: &DeltaCounts, current_count: u64, staging_count: u64) {
    if counts.deletes > current_count {
        warn!(
            deletes = counts.deletes,
            current_count, "delta sanity check failed: deletes exceed current row count"
        );
    }
    if staging_count == 0 && counts.inserts != 0 {
        warn!(
            inserts = counts.inserts,
            "delta sanity check failed: empty staging produced nonzero inserts"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanity_check_does_not_panic_on_violation() {
        // sanity_check only logs; verify it tolerates the violating inputs.
        sanity_check(&DeltaCounts { inserts: 5, updates: 0, deletes: 100 }, 3, 0);
        sanity_check(&DeltaCounts { inserts: 1, updates: 0, deletes: 0 }, 10, 0);
        sanity_check(&DeltaCounts::default(), 0, 0);
    }
}
