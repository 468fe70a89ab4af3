//! Schema bootstrap (§2.1 "Schema bootstrap").
//!
//! Per-entity tables are dynamic and created on demand via generated
//! `CREATE TABLE IF NOT EXISTS` (`partition.rs`). The one shape that's fixed
//! across every deployment — a bookkeeping log recording which schemas this
//! engine has bootstrapped — is expressed as a compiled migration, mirroring
//! a compiled `embed_migrations!` + `run_pending_migrations` bootstrap.
//! Migrations run over a plain sync `diesel::PgConnection`, since
//! `diesel_migrations` has no async harness; this happens once, before the
//! async pool starts serving ingestions.

use diesel::prelude::*;
use diesel::sql_query;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use ingest_core::error::IngestError;
use tracing::info;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// Runs every pending embedded migration against `database_url`, then records
/// `schema` in `ingest_schema_bootstrap`.
pub fn run_migrations(database_url: &str, schema: &str) -> Result<(), IngestError> {
    info!(schema, "bootstrapping ingest-storage schema");
    let mut conn = PgConnection::establish(database_url)
        .map_err(|err| IngestError::Store(format!("failed to connect for migrations: {err}")))?;

    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| IngestError::Store(format!("migrations failed: {err}")))?;

    sql_query(
        "INSERT INTO ingest_schema_bootstrap (schema_name) VALUES ($1) \
         ON CONFLICT (schema_name) DO NOTHING",
    )
    .bind::<diesel::sql_types::Text, _>(schema)
    .execute(&mut conn)
    .map_err(|err| IngestError::Store(format!("failed to record schema bootstrap: {err}")))?;

    Ok(())
}
