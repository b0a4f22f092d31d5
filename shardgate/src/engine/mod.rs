//! Storage-engine adapters.
//!
//! The gateway sees every shard through one narrow interface:
//! [`StorageEngine`]. Two adapters implement it, a Postgres-family one
//! and a SQLite-family one, each wrapping a [`Backend`]: the embedded
//! engine driver itself, which is an external collaborator. The adapters
//! own placeholder rewriting, dialect translation, error classification
//! and type mapping; they never own persistence.

use std::fmt::Display;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod dialect;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod placeholder;
pub mod postgres;
pub mod sqlite;
pub mod types;

pub use error::{classify_postgres, classify_sqlite, BackendError, ConstraintKind, Error};
pub use placeholder::bind_placeholders;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

use crate::net::{Datum, ExecuteResult, QueryResult};
use crate::stats::{SchemaObjectKind, TableSchema};

/// Engine family; picks the dialect and placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Postgres,
    Sqlite,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Sqlite => "sqlite",
        }
    }
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options forwarded to every per-shard begin.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct TransactionOptions {
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[serde(default)]
    pub read_only: bool,
    /// Tablet-side transaction deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Opaque fence for a prepared transaction. The engine persists the
/// prepare under this token; resolution requires the exact token back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrepareToken(String);

impl PrepareToken {
    pub fn new(text: &str) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrepareToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Column of a table as the raw engine describes it.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub native_type: String,
    pub nullable: bool,
}

/// Table as the raw engine describes it.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub name: String,
    pub kind: SchemaObjectKind,
    pub columns: Vec<RawColumn>,
}

/// The embedded engine driver. SQL reaching it is already in the
/// engine's native dialect with native placeholders.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, BackendError>;
    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, BackendError>;
    /// Open a transaction; the session is inside it until commit/rollback.
    async fn begin(&self) -> Result<Box<dyn BackendSession>, BackendError>;
    async fn schema(&self) -> Result<Vec<RawTable>, BackendError>;
    async fn close(&self) -> Result<(), BackendError>;
}

/// One open transaction on the raw engine.
#[async_trait]
pub trait BackendSession: Send + Sync {
    async fn query(&mut self, sql: &str, params: &[Datum]) -> Result<QueryResult, BackendError>;
    async fn execute(&mut self, sql: &str, params: &[Datum])
        -> Result<ExecuteResult, BackendError>;
    async fn commit(&mut self) -> Result<(), BackendError>;
    async fn rollback(&mut self) -> Result<(), BackendError>;
}

/// The narrow interface a tablet drives.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error>;

    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error>;

    async fn begin(&self, options: TransactionOptions)
        -> Result<Box<dyn EngineTransaction>, Error>;

    /// Resolve a previously prepared transaction. Idempotent: repeating a
    /// resolution that already happened succeeds.
    async fn commit_prepared(&self, token: &PrepareToken) -> Result<(), Error>;

    async fn rollback_prepared(&self, token: &PrepareToken) -> Result<(), Error>;

    /// Tokens of transactions prepared but not yet resolved, for recovery.
    async fn prepared_transactions(&self) -> Result<Vec<PrepareToken>, Error>;

    async fn schema(&self) -> Result<Vec<TableSchema>, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// One open transaction, as the tablet sees it.
#[async_trait]
pub trait EngineTransaction: Send + Sync {
    async fn query(&mut self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error>;

    async fn execute(&mut self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error>;

    async fn commit(&mut self) -> Result<(), Error>;

    async fn rollback(&mut self) -> Result<(), Error>;

    /// Persist the transaction under `token` and detach it from this
    /// session; resolution goes through the engine afterwards.
    async fn prepare(&mut self, token: &PrepareToken) -> Result<(), Error>;
}

pub(crate) fn map_raw_schema(
    tables: Vec<RawTable>,
    map: fn(&str) -> crate::net::DataType,
) -> Vec<TableSchema> {
    tables
        .into_iter()
        .map(|table| TableSchema {
            name: table.name,
            kind: table.kind,
            columns: table
                .columns
                .into_iter()
                .map(|column| crate::stats::ColumnSchema {
                    data_type: map(&column.native_type),
                    name: column.name,
                    nullable: column.nullable,
                })
                .collect(),
        })
        .collect()
}
