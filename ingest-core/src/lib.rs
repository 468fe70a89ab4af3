//! # ingest-core
//!
//! Shared types for the snapshot ingestion engine: column/schema declarations,
//! per-ingestion configuration, the crate-wide error type, and the small trait
//! surface a collector ("view") implements to hand the engine a snapshot.
//!
//! This crate does no I/O. The Postgres-backed implementation of the engine
//! itself lives in `ingest-storage`.

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod config;
pub mod error;
pub mod models;
pub mod view;

pub use config::{CreditsDeltaSpec, FactConfig, ScdConfig};
pub use error::IngestError;
pub use models::{ChangeOp, ColumnSpec};
pub use view::{Row, RowSource};
