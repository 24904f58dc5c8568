//! Domain store traits: schema introspection and raw query execution.
//!
//! The pipeline never talks SQL drivers directly. It sees these two traits,
//! implemented by the Postgres adapter in production and by scripted
//! in-memory stores in tests.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::rows::{RowSet, StaticTables};

/// Describes the store to the reasoning engine.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Whether the store answers at all.
    async fn test_connection(&self) -> bool;

    /// A formatted description of the tables and columns.
    ///
    /// `Ok(None)` means the store is reachable but exposes nothing.
    async fn schema_description(&self) -> std::result::Result<Option<String>, StoreError>;

    /// The configured reference tables. Tables that fail to load are skipped.
    async fn static_tables(&self) -> StaticTables;
}

/// Runs a single query string.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Zero rows is `Ok(RowSet::empty())`; only execution errors fail.
    async fn execute(&self, query: &str) -> std::result::Result<RowSet, StoreError>;
}
