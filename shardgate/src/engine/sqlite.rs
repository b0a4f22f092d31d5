//! SQLite-family adapter.
//!
//! Statements are translated from the gateway's Postgres-flavored SQL and
//! rebound to `?` placeholders on the way in. The engine has no native
//! prepared transactions, so prepare parks the open session in a registry
//! keyed by token; commit/rollback-prepared resolve it from there.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::dialect::postgres_to_sqlite;
use super::error::{classify_sqlite, Error};
use super::placeholder::bind_placeholders;
use super::types::from_sqlite_decl;
use super::{
    map_raw_schema, Backend, BackendSession, EngineKind, EngineTransaction, PrepareToken,
    StorageEngine, TransactionOptions,
};
use crate::net::{Datum, ExecuteResult, QueryResult};
use crate::stats::TableSchema;

type PreparedSessions = Arc<Mutex<HashMap<String, Box<dyn BackendSession>>>>;

pub struct SqliteEngine {
    backend: Box<dyn Backend>,
    closed: AtomicBool,
    /// Sessions parked by `prepare`, waiting for resolution.
    prepared: PreparedSessions,
    resolved: Mutex<HashSet<String>>,
}

impl SqliteEngine {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
            prepared: Arc::new(Mutex::new(HashMap::new())),
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

    fn translate(sql: &str, params: &[Datum]) -> Result<(String, Vec<Datum>), Error> {
        let translated = postgres_to_sqlite(sql);
        bind_placeholders(&translated, params, EngineKind::Sqlite)
    }

    /// `Ok(None)` means the token was already resolved: an idempotent
    /// no-op for the caller.
    fn take_prepared(
        &self,
        token: &PrepareToken,
    ) -> Result<Option<Box<dyn BackendSession>>, Error> {
        if let Some(session) = self.prepared.lock().remove(token.as_str()) {
            return Ok(Some(session));
        }
        if self.resolved.lock().contains(token.as_str()) {
            Ok(None)
        } else {
            Err(Error::TransactionNotFound(token.as_str().to_string()))
        }
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        self.ensure_open()?;
        let (sql, bound) = Self::translate(sql, params)?;
        self.backend
            .query(&sql, &bound)
            .await
            .map_err(classify_sqlite)
    }

    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        self.ensure_open()?;
        let (sql, bound) = Self::translate(sql, params)?;
        self.backend
            .execute(&sql, &bound)
            .await
            .map_err(classify_sqlite)
    }

    async fn begin(
        &self,
        options: TransactionOptions,
    ) -> Result<Box<dyn EngineTransaction>, Error> {
        self.ensure_open()?;
        // Isolation options are accepted and ignored; the engine is
        // serializable by construction.
        let session = self.backend.begin().await.map_err(classify_sqlite)?;
        Ok(Box::new(SqliteTransaction {
            session: Some(session),
            read_only: options.read_only,
            prepared: Arc::clone(&self.prepared),
        }))
    }

    async fn commit_prepared(&self, token: &PrepareToken) -> Result<(), Error> {
        self.ensure_open()?;
        let Some(mut session) = self.take_prepared(token)? else {
            return Ok(());
        };
        if let Err(err) = session.commit().await {
            // Park the session again so the coordinator can retry.
            self.prepared
                .lock()
                .insert(token.as_str().to_string(), session);
            return Err(classify_sqlite(err));
        }
        self.resolved.lock().insert(token.as_str().to_string());
        Ok(())
    }

    async fn rollback_prepared(&self, token: &PrepareToken) -> Result<(), Error> {
        self.ensure_open()?;
        let Some(mut session) = self.take_prepared(token)? else {
            return Ok(());
        };
        if let Err(err) = session.rollback().await {
            self.prepared
                .lock()
                .insert(token.as_str().to_string(), session);
            return Err(classify_sqlite(err));
        }
        self.resolved.lock().insert(token.as_str().to_string());
        Ok(())
    }

    async fn prepared_transactions(&self) -> Result<Vec<PrepareToken>, Error> {
        self.ensure_open()?;
        Ok(self
            .prepared
            .lock()
            .keys()
            .map(|token| PrepareToken::new(token))
            .collect())
    }

    async fn schema(&self) -> Result<Vec<TableSchema>, Error> {
        self.ensure_open()?;
        let tables = self.backend.schema().await.map_err(classify_sqlite)?;
        Ok(map_raw_schema(tables, from_sqlite_decl))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Parked prepared sessions die with the engine; recovery will
        // decide their fate from the coordinator log.
        self.prepared.lock().clear();
        self.backend.close().await.map_err(classify_sqlite)
    }
}

struct SqliteTransaction {
    session: Option<Box<dyn BackendSession>>,
    read_only: bool,
    prepared: PreparedSessions,
}

impl SqliteTransaction {
    fn session(&mut self) -> Result<&mut Box<dyn BackendSession>, Error> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))
    }
}

#[async_trait]
impl EngineTransaction for SqliteTransaction {
    async fn query(&mut self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        let (sql, bound) = SqliteEngine::translate(sql, params)?;
        self.session()?
            .query(&sql, &bound)
            .await
            .map_err(classify_sqlite)
    }

    async fn execute(&mut self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction);
        }
        let (sql, bound) = SqliteEngine::translate(sql, params)?;
        self.session()?
            .execute(&sql, &bound)
            .await
            .map_err(classify_sqlite)
    }

    async fn commit(&mut self) -> Result<(), Error> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))?;
        session.commit().await.map_err(classify_sqlite)
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))?;
        session.rollback().await.map_err(classify_sqlite)
    }

    async fn prepare(&mut self, token: &PrepareToken) -> Result<(), Error> {
        let session = self
            .session
            .take()
            .ok_or_else(|| Error::Transaction("transaction already finished".into()))?;
        self.prepared
            .lock()
            .insert(token.as_str().to_string(), session);
        Ok(())
    }
}
