//! # ingest-storage
//!
//! The Postgres-backed implementation of the snapshot ingestion engine. See
//! `ingest_core` for the store-agnostic types (config, column declarations,
//! the view contract, the crate-wide error type) and `postgres::engine` for
//! the public façade that implements the seven calls a view makes (§6.2).

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod postgres;

pub use postgres::engine::SnapshotEngine;
