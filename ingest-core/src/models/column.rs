//! Column schema declarations.
//!
//! Primary-key and payload columns are declared by callers as ordered
//! `name:type` pairs (e.g. `"id:VARCHAR"`). Since the engine composes SQL by
//! interpolating these names and types into generated statements (`current`,
//! `history`, staging and fact tables all have runtime-declared shapes), every
//! name is checked against a conservative identifier pattern before it is
//! accepted — see `is_valid_identifier`. Never skip this check to interpolate
//! a user- or config-supplied string into SQL.

use crate::error::IngestError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex"))
}

/// Returns true if `name` is safe to interpolate unescaped into generated SQL
/// as an identifier: starts with a letter or underscore, followed by letters,
/// digits or underscores. Deliberately conservative — no quoting, no dots, no
/// reserved-word awareness. Anything that doesn't match this should be
/// rejected rather than quoted, since quoting rules are dialect-specific and
/// easy to get wrong.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.len() <= 63 && identifier_regex().is_match(name)
}

/// A single `name:type` declaration, e.g. `id:VARCHAR` or `age:INTEGER`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        ColumnSpec { name: name.into(), sql_type: sql_type.into() }
    }

    /// Parses a single `name:type` declaration.
    pub fn parse(spec: &str) -> Result<Self, IngestError> {
        let (name, sql_type) = spec.split_once(':').ok_or_else(|| {
            IngestError::Validation(format!(
                "column spec {spec:?} is not of the form \"name:type\""
            ))
        })?;
        let name = name.trim();
        let sql_type = sql_type.trim();
        if name.is_empty() || sql_type.is_empty() {
            return Err(IngestError::Validation(format!(
                "column spec {spec:?} is not of the form \"name:type\""
            )));
        }
        if !is_valid_identifier(name) {
            return Err(IngestError::Validation(format!(
                "column name {name:?} is not a valid identifier"
            )));
        }
        Ok(ColumnSpec::new(name, sql_type))
    }

    /// Parses a comma-separated list of `name:type` declarations, in order.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, IngestError> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// Validates a physical table base name (the `table_base_name`/`table_name`
/// config option) as a safe identifier fragment.
pub fn validate_table_base_name(name: &str) -> Result<(), IngestError> {
    if !is_valid_identifier(name) {
        return Err(IngestError::Validation(format!(
            "table base name {name:?} is not a valid identifier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("id", true)]
    #[case("_id", true)]
    #[case("device_id_2", true)]
    #[case("", false)]
    #[case("2id", false)]
    #[case("id;DROP TABLE x", false)]
    #[case("id name", false)]
    #[case("id.name", false)]
    fn identifier_validation(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_valid_identifier(input), expected);
    }

    #[test]
    fn parses_single_column() {
        let c = ColumnSpec::parse("id:VARCHAR").unwrap();
        assert_eq!(c, ColumnSpec::new("id", "VARCHAR"));
    }

    #[test]
    fn parses_column_with_whitespace() {
        let c = ColumnSpec::parse(" id : VARCHAR ").unwrap();
        assert_eq!(c, ColumnSpec::new("id", "VARCHAR"));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(ColumnSpec::parse("id").is_err());
    }

    #[test]
    fn rejects_invalid_identifier() {
        assert!(ColumnSpec::parse("id; drop table x:VARCHAR").is_err());
    }

    #[test]
    fn parses_ordered_list() {
        let cols = ColumnSpec::parse_list("name:VARCHAR,age:INTEGER").unwrap();
        assert_eq!(
            cols,
            vec![ColumnSpec::new("name", "VARCHAR"), ColumnSpec::new("age", "INTEGER")]
        );
    }

    #[test]
    fn empty_list_parses_to_empty_vec() {
        assert_eq!(ColumnSpec::parse_list("").unwrap(), Vec::<ColumnSpec>::new());
    }
}
