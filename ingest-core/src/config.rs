//! Per-ingestion configuration (§6.2).
//!
//! `ScdConfig` and `FactConfig` are validated eagerly, before any I/O: a bad
//! config is a `IngestError::Validation` the caller sees immediately, never a
//! retried or partially-applied failure.

use crate::error::IngestError;
use crate::models::column::{is_valid_identifier, validate_table_base_name};
use crate::models::ColumnSpec;
use chrono::NaiveDateTime;
use std::collections::HashSet;

/// Configuration for one SCD2 ingestion of logical entity `table_base_name`.
#[derive(Debug, Clone)]
pub struct ScdConfig {
    /// Logical entity name; physical tables are `<table_base_name>_current`,
    /// `<table_base_name>_history`, `<table_base_name>_ingest_runs`.
    pub table_base_name: String,
    /// Timestamp applied to every row written by this run.
    pub snapshot_ts: NaiveDateTime,
    /// Ordered primary-key column declarations.
    pub primary_key_columns: Vec<ColumnSpec>,
    /// Ordered payload column declarations. Hashing and change detection
    /// consider only these columns.
    pub payload_columns: Vec<ColumnSpec>,
    /// When set, keys present in `current` but absent from this snapshot are
    /// deleted and a tombstone is written. When unset, deletes are never
    /// detected (§4.2).
    pub missing_means_deleted: bool,
    /// When set, a row is written to `<table_base_name>_ingest_runs`
    /// summarising this run.
    pub track_ingest_runs: bool,
    /// Opaque run identifier. Defaults to `run_<unix_seconds>` of
    /// `snapshot_ts` if not set explicitly via `with_run_id`.
    pub run_id: String,
}

impl ScdConfig {
    pub fn new(
        table_base_name: impl Into<String>,
        snapshot_ts: NaiveDateTime,
        primary_key_columns: Vec<ColumnSpec>,
        payload_columns: Vec<ColumnSpec>,
    ) -> Self {
        let table_base_name = table_base_name.into();
        let run_id = default_run_id(&snapshot_ts);
        ScdConfig {
            table_base_name,
            snapshot_ts,
            primary_key_columns,
            payload_columns,
            missing_means_deleted: false,
            track_ingest_runs: false,
            run_id,
        }
    }

    pub fn with_missing_means_deleted(mut self, on: bool) -> Self {
        self.missing_means_deleted = on;
        self
    }

    pub fn with_track_ingest_runs(mut self, on: bool) -> Self {
        self.track_ingest_runs = on;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// All columns in declared order: primary key columns first, then
    /// payload columns. This is the order the CSV writer must emit fields in.
    pub fn all_columns(&self) -> Vec<&ColumnSpec> {
        self.primary_key_columns
            .iter()
            .chain(self.payload_columns.iter())
            .collect()
    }

    pub fn current_table(&self) -> String {
        format!("{}_current", self.table_base_name)
    }

    pub fn history_table(&self) -> String {
        format!("{}_history", self.table_base_name)
    }

    pub fn ingest_runs_table(&self) -> String {
        format!("{}_ingest_runs", self.table_base_name)
    }

    /// Validates this config. Never touches the store.
    pub fn validate(&self) -> Result<(), IngestError> {
        tracing::debug!(table_base_name = %self.table_base_name, run_id = %self.run_id, "validating scd config");
        validate_table_base_name(&self.table_base_name)?;

        if self.primary_key_columns.is_empty() {
            return Err(IngestError::Validation(
                "primary_key_columns must not be empty".into(),
            ));
        }
        if self.payload_columns.is_empty() {
            return Err(IngestError::Validation(
                "payload_columns must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for col in self.all_columns() {
            if !is_valid_identifier(&col.name) {
                return Err(IngestError::Validation(format!(
                    "column name {:?} is not a valid identifier",
                    col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(IngestError::Validation(format!(
                    "column {:?} is declared more than once",
                    col.name
                )));
            }
        }

        if self.run_id.is_empty() {
            return Err(IngestError::Validation("run_id must not be empty".into()));
        }

        Ok(())
    }
}

fn default_run_id(snapshot_ts: &NaiveDateTime) -> String {
    format!("run_{}", snapshot_ts.and_utc().timestamp())
}

/// Configuration for the specialised credits-delta computation (§4.5): for
/// each newly-appended row, the delta against the latest existing row
/// sharing `key_columns` is computed under three rules — same epoch yields a
/// non-negative difference, an epoch+1 rollover yields NULL, and any other
/// gap (including no prior row) yields NULL.
#[derive(Debug, Clone)]
pub struct CreditsDeltaSpec {
    pub epoch_column: String,
    pub key_columns: Vec<String>,
    pub credits_column: String,
    /// Column written with the computed delta. Must already be declared in
    /// `FactConfig::columns` (typically a nullable integer type).
    pub output_column: String,
}

impl CreditsDeltaSpec {
    pub fn new(
        epoch_column: impl Into<String>,
        key_columns: Vec<String>,
        credits_column: impl Into<String>,
        output_column: impl Into<String>,
    ) -> Self {
        CreditsDeltaSpec {
            epoch_column: epoch_column.into(),
            key_columns,
            credits_column: credits_column.into(),
            output_column: output_column.into(),
        }
    }
}

/// Configuration for an append-only fact table (§4.5).
#[derive(Debug, Clone)]
pub struct FactConfig {
    pub table_name: String,
    /// Ordered column declarations, identity columns and measures alike.
    pub columns: Vec<ColumnSpec>,
    /// Whether `<table_name>_raw` is partitioned by `year/month/day` of
    /// `time_column`.
    pub partition_by_time: bool,
    /// Required when `partition_by_time` is set. Must name one of `columns`.
    pub time_column: Option<String>,
    /// When set, every append computes and writes `output_column` per the
    /// credits-delta rule.
    pub credits_delta: Option<CreditsDeltaSpec>,
}

impl FactConfig {
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        FactConfig {
            table_name: table_name.into(),
            columns,
            partition_by_time: false,
            time_column: None,
            credits_delta: None,
        }
    }

    pub fn with_time_partitioning(mut self, time_column: impl Into<String>) -> Self {
        self.partition_by_time = true;
        self.time_column = Some(time_column.into());
        self
    }

    pub fn with_credits_delta(mut self, spec: CreditsDeltaSpec) -> Self {
        self.credits_delta = Some(spec);
        self
    }

    pub fn raw_table(&self) -> String {
        format!("{}_raw", self.table_name)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        validate_table_base_name(&self.table_name)?;

        if self.columns.is_empty() {
            return Err(IngestError::Validation("columns must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for col in &self.columns {
            if !is_valid_identifier(&col.name) {
                return Err(IngestError::Validation(format!(
                    "column name {:?} is not a valid identifier",
                    col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(IngestError::Validation(format!(
                    "column {:?} is declared more than once",
                    col.name
                )));
            }
        }

        match (self.partition_by_time, &self.time_column) {
            (true, None) => {
                return Err(IngestError::Validation(
                    "partition_by_time requires time_column".into(),
                ))
            }
            (true, Some(tc)) => {
                if !self.columns.iter().any(|c| &c.name == tc) {
                    return Err(IngestError::Validation(format!(
                        "time_column {tc:?} is not among the declared columns"
                    )));
                }
            }
            (false, _) => {}
        }

        if let Some(spec) = &self.credits_delta {
            let declared = |name: &str| self.columns.iter().any(|c| c.name == name);
            if !declared(&spec.epoch_column) {
                return Err(IngestError::Validation(format!(
                    "credits_delta epoch_column {:?} is not among the declared columns",
                    spec.epoch_column
                )));
            }
            if !declared(&spec.credits_column) {
                return Err(IngestError::Validation(format!(
                    "credits_delta credits_column {:?} is not among the declared columns",
                    spec.credits_column
                )));
            }
            if !declared(&spec.output_column) {
                return Err(IngestError::Validation(format!(
                    "credits_delta output_column {:?} is not among the declared columns",
                    spec.output_column
                )));
            }
            if spec.key_columns.is_empty() {
                return Err(IngestError::Validation(
                    "credits_delta key_columns must not be empty".into(),
                ));
            }
            for key in &spec.key_columns {
                if !declared(key) {
                    return Err(IngestError::Validation(format!(
                        "credits_delta key column {key:?} is not among the declared columns"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn default_run_id_is_deterministic_from_snapshot_ts() {
        let cfg = ScdConfig::new(
            "e1",
            ts(),
            vec![ColumnSpec::new("id", "VARCHAR")],
            vec![ColumnSpec::new("name", "VARCHAR")],
        );
        assert_eq!(cfg.run_id, format!("run_{}", ts().and_utc().timestamp()));
    }

    #[test]
    fn rejects_empty_primary_key_columns() {
        let cfg = ScdConfig::new("e1", ts(), vec![], vec![ColumnSpec::new("n", "VARCHAR")]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_payload_columns() {
        let cfg = ScdConfig::new("e1", ts(), vec![ColumnSpec::new("id", "VARCHAR")], vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_column_names_across_pk_and_payload() {
        let cfg = ScdConfig::new(
            "e1",
            ts(),
            vec![ColumnSpec::new("id", "VARCHAR")],
            vec![ColumnSpec::new("id", "INTEGER")],
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        let cfg = ScdConfig::new(
            "e1",
            ts(),
            vec![ColumnSpec::new("id", "VARCHAR")],
            vec![ColumnSpec::new("name", "VARCHAR"), ColumnSpec::new("age", "INTEGER")],
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.current_table(), "e1_current");
        assert_eq!(cfg.history_table(), "e1_history");
        assert_eq!(cfg.ingest_runs_table(), "e1_ingest_runs");
    }

    #[test]
    fn fact_config_requires_time_column_when_partitioned() {
        let mut cfg = FactConfig::new("votes", vec![ColumnSpec::new("t", "TIMESTAMP")]);
        cfg.partition_by_time = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fact_config_time_column_must_be_declared() {
        let cfg = FactConfig::new("votes", vec![ColumnSpec::new("t", "TIMESTAMP")])
            .with_time_partitioning("missing_col");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fact_config_accepts_well_formed_partitioning() {
        let cfg = FactConfig::new("votes", vec![ColumnSpec::new("t", "TIMESTAMP")])
            .with_time_partitioning("t");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.raw_table(), "votes_raw");
    }

    fn vote_columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("validator", "VARCHAR"),
            ColumnSpec::new("epoch", "BIGINT"),
            ColumnSpec::new("credits", "BIGINT"),
            ColumnSpec::new("credits_delta", "BIGINT"),
        ]
    }

    #[test]
    fn credits_delta_accepts_well_formed_spec() {
        let cfg = FactConfig::new("vote_credits", vote_columns()).with_credits_delta(
            CreditsDeltaSpec::new("epoch", vec!["validator".into()], "credits", "credits_delta"),
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn credits_delta_rejects_undeclared_epoch_column() {
        let cfg = FactConfig::new("vote_credits", vote_columns()).with_credits_delta(
            CreditsDeltaSpec::new("missing_epoch", vec!["validator".into()], "credits", "credits_delta"),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credits_delta_rejects_empty_key_columns() {
        let cfg = FactConfig::new("vote_credits", vote_columns())
            .with_credits_delta(CreditsDeltaSpec::new("epoch", vec![], "credits", "credits_delta"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credits_delta_rejects_undeclared_key_column() {
        let cfg = FactConfig::new("vote_credits", vote_columns()).with_credits_delta(
            CreditsDeltaSpec::new("epoch", vec!["missing_key".into()], "credits", "credits_delta"),
        );
        assert!(cfg.validate().is_err());
    }
}
