//! Guards against unescaped interpolation of caller-controlled strings into
//! generated SQL (§9, "Dynamic column lists"). Every query builder in this
//! module should call `checked` on every table and column name before it ever
//! appears in a `format!`-built SQL string.

use ingest_core::error::IngestError;
use ingest_core::models::column::is_valid_identifier;

/// Returns `name` unchanged if it is safe to interpolate as a bare SQL
/// identifier, otherwise a `Validation` error.
pub fn checked<'a>(name: &'a str) -> Result<&'a str, IngestError> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(IngestError::Validation(format!(
            "refusing to interpolate {name:?} into SQL: not a valid identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifier() {
        assert_eq!(checked("device_id").unwrap(), "device_id");
    }

    #[test]
    fn rejects_sql_injection_attempt() {
        assert!(checked("id; DROP TABLE users; --").is_err());
    }

}
