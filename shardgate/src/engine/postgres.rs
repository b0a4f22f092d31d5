//! Postgres-family adapter.
//!
//! The native dialect already matches what the gateway speaks, so the
//! adapter's work is placeholder normalization (`?` → `$n`), error
//! classification by SQLSTATE, and the prepared-transaction statements
//! used by two-phase commit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{classify_postgres, Error};
use super::placeholder::bind_placeholders;
use super::types::from_postgres_name;
use super::{
    map_raw_schema, Backend, BackendSession, EngineKind, EngineTransaction, IsolationLevel,
    PrepareToken, StorageEngine, TransactionOptions,
};
use crate::net::{Datum, ExecuteResult, QueryResult};
use crate::stats::TableSchema;

pub struct PostgresEngine {
    backend: Box<dyn Backend>,
    closed: AtomicBool,
    /// Tokens already resolved, so resolution is idempotent.
    resolved: Mutex<HashSet<String>>,
}

impl PostgresEngine {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
            resolved: Mutex::new(HashSet::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageEngine for PostgresEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        self.ensure_open()?;
        let (sql, bound) = bind_placeholders(sql, params, EngineKind::Postgres)?;
        self.backend
            .query(&sql, &bound)
            .await
            .map_err(classify_postgres)
    }

    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        self.ensure_open()?;
        let (sql, bound) = bind_placeholders(sql, params, EngineKind::Postgres)?;
        self.backend
            .execute(&sql, &bound)
            .await
            .map_err(classify_postgres)
    }

    async fn begin(
        &self,
        options: TransactionOptions,
    ) -> Result<Box<dyn EngineTransaction>, Error> {
        self.ensure_open()?;
        let mut session = self.backend.begin().await.map_err(classify_postgres)?;

        if options.isolation != IsolationLevel::default() {
            let sql = format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                options.isolation.as_sql()
            );
            session
                .execute(&sql, &[])
                .await
                .map_err(classify_postgres)?;
        }
        if options.read_only {
            session
                .execute("SET TRANSACTION READ ONLY", &[])
                .await
                .map_err(classify_postgres)?;
        }

        Ok(Box::new(PostgresTransaction {
            session: Some(session),
            read_only: options.read_only,
        }))
    }

    async fn commit_prepared(&self, token: &PrepareToken) -> Result<(), Error> {
        self.ensure_open()?;
        if self.resolved.lock().contains(token.as_str()) {
            return Ok(());
        }
        let sql = format!("COMMIT PREPARED '{}'", token);
        self.backend
            .execute(&sql, &[])
            .await
            .map_err(classify_postgres)?;
        self.resolved.lock().insert(token.as_str().to_string());
        Ok(())
    }

    async fn rollback_prepared(&self, token: &PrepareToken) -> Result<(), Error> {
        self.ensure_open()?;
        if self.resolved.lock().contains(token.as_str()) {
            return Ok(());
        }
        let sql = format!("ROLLBACK PREPARED '{}'", token);
        self.backend
            .execute(&sql, &[])
            .await
            .map_err(classify_postgres)?;
        self.resolved.lock().insert(token.as_str().to_string());
        Ok(())
    }

    async fn prepared_transactions(&self) -> Result<Vec<PrepareToken>, Error> {
        self.ensure_open()?;
        let result = self
            .backend
            .query("SELECT gid FROM pg_prepared_xacts", &[])
            .await
            .map_err(classify_postgres)?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get("gid"))
            .filter_map(|datum| match datum {
                Datum::Text(gid) => Some(PrepareToken::new(gid)),
                _ => None,
            })
            .collect())
    }

    async fn schema(&self) -> Result<Vec<TableSchema>, Error> {
        self.ensure_open()?;
        let tables = self.backend.schema().await.map_err(classify_postgres)?;
        Ok(map_raw_schema(tables, from_postgres_name))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close().await.map_err(classify_postgres)
    }
}

struct PostgresTransaction {
    /// `None` once committed, rolled back or prepared away.
    session: Option<Box<dyn BackendSession>>,
    read_only: bool,
}

impl PostgresTransaction {
    fn session(&mut self) -> Result<&mut Box<dyn BackendSession>, Error> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))
    }
}

#[async_trait]
impl EngineTransaction for PostgresTransaction {
    async fn query(&mut self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        let (sql, bound) = bind_placeholders(sql, params, EngineKind::Postgres)?;
        self.session()?
            .query(&sql, &bound)
            .await
            .map_err(classify_postgres)
    }

    async fn execute(&mut self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction);
        }
        let (sql, bound) = bind_placeholders(sql, params, EngineKind::Postgres)?;
        self.session()?
            .execute(&sql, &bound)
            .await
            .map_err(classify_postgres)
    }

    async fn commit(&mut self) -> Result<(), Error> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))?;
        session.commit().await.map_err(classify_postgres)
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))?;
        session.rollback().await.map_err(classify_postgres)
    }

    async fn prepare(&mut self, token: &PrepareToken) -> Result<(), Error> {
        let sql = format!("PREPARE TRANSACTION '{}'", token);
        self.session()?
            .execute(&sql, &[])
            .await
            .map_err(classify_postgres)?;
        // The transaction is now persisted and detached from the session.
        self.session = None;
        Ok(())
    }
}
