//! Shared NULL-safe join-predicate building (§4.2, §3.2.4).
//!
//! Staging tables always carry primary-key columns as `TEXT` (§4.1,
//! deliberately, so lexicographic comparison suffices for hashing); every
//! other table declares its primary key with the caller's real SQL type.
//! Joining the two requires casting the staging side explicitly, since
//! Postgres has no implicit `text -> integer` (etc.) assignment cast for
//! comparison operators.

use ingest_core::error::IngestError;
use ingest_core::models::column::ColumnSpec;

use super::sql_ident::checked;

/// Builds `staging_alias.col::sql_type IS NOT DISTINCT FROM typed_alias.col
/// AND ...` over `pk_columns`, in order.
pub fn null_safe_key_join(
    pk_columns: &[ColumnSpec],
    staging_alias: &str,
    typed_alias: &str,
) -> Result<String, IngestError> {
    let clauses = pk_columns
        .iter()
        .map(|col| {
            let name = checked(&col.name)?;
            Ok::<_, IngestError>(format!(
                "{staging_alias}.{name}::{sql_type} IS NOT DISTINCT FROM {typed_alias}.{name}",
                sql_type = col.sql_type
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clauses.join(" AND "))
}

/// Builds a plain (no-cast) NULL-safe join predicate between two tables that
/// both declare the primary key with the same real SQL type, e.g. `current`
/// joined against `history`.
pub fn null_safe_key_join_typed(
    pk_columns: &[ColumnSpec],
    left_alias: &str,
    right_alias: &str,
) -> Result<String, IngestError> {
    let clauses = pk_columns
        .iter()
        .map(|col| {
            let name = checked(&col.name)?;
            Ok::<_, IngestError>(format!(
                "{left_alias}.{name} IS NOT DISTINCT FROM {right_alias}.{name}"
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clauses.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_staging_side_to_declared_sql_type() {
        let cols = vec![ColumnSpec::new("id", "INTEGER"), ColumnSpec::new("region", "VARCHAR")];
        let join = null_safe_key_join(&cols, "s", "c").unwrap();
        assert_eq!(
            join,
            "s.id::INTEGER IS NOT DISTINCT FROM c.id AND s.region::VARCHAR IS NOT DISTINCT FROM c.region"
        );
    }

    #[test]
    fn typed_join_has_no_casts() {
        let cols = vec![ColumnSpec::new("id", "INTEGER")];
        let join = null_safe_key_join_typed(&cols, "c", "h").unwrap();
        assert_eq!(join, "c.id IS NOT DISTINCT FROM h.id");
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(null_safe_key_join(&[ColumnSpec::new("id; drop", "INTEGER")], "s", "c").is_err());
    }
}
