//! Per-shard executor.
//!
//! A tablet owns one storage engine and every live transaction handle on
//! its shard. It enforces the transaction limit, the handle state
//! machine, the per-handle deadline, and the single-writer lock for
//! engines that need it. Engines can be swapped at runtime behind a
//! probe, provided no transaction is open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub mod error;
pub mod transaction;

pub use error::Error;
pub use transaction::TxState;

use transaction::TransactionSlot;

use crate::engine::{
    EngineKind, EngineTransaction, PrepareToken, StorageEngine, TransactionOptions,
};
use crate::net::{Datum, ExecuteResult, QueryResult};
use crate::stats::{ShardCounters, ShardHealth, TableSchema};

#[derive(Debug, Clone, Copy)]
pub struct TabletOptions {
    /// Open (non-terminal) transactions allowed at once.
    pub max_transactions: usize,
    /// Default per-transaction deadline; begin options can override.
    pub transaction_timeout: Option<Duration>,
}

impl Default for TabletOptions {
    fn default() -> Self {
        Self {
            max_transactions: 128,
            transaction_timeout: None,
        }
    }
}

struct Inner {
    keyspace: String,
    shard: String,
    engine: RwLock<Arc<dyn StorageEngine>>,
    transactions: Mutex<HashMap<u64, TransactionSlot>>,
    next_id: AtomicU64,
    options: TabletOptions,
    /// One writer at a time on single-writer engines.
    write_lock: Arc<Semaphore>,
    /// Serializes engine swaps against new begins.
    swap_lock: tokio::sync::Mutex<()>,
    counters: ShardCounters,
}

#[derive(Clone)]
pub struct Tablet {
    inner: Arc<Inner>,
}

enum Gate {
    Taken(Box<dyn EngineTransaction>),
    Expire {
        engine_tx: Option<Box<dyn EngineTransaction>>,
        prepared_token: Option<PrepareToken>,
    },
}

impl Tablet {
    pub fn new(keyspace: &str, shard: &str, engine: Arc<dyn StorageEngine>) -> Self {
        Self::with_options(keyspace, shard, engine, TabletOptions::default())
    }

    pub fn with_options(
        keyspace: &str,
        shard: &str,
        engine: Arc<dyn StorageEngine>,
        options: TabletOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                keyspace: keyspace.into(),
                shard: shard.into(),
                engine: RwLock::new(engine),
                transactions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                options,
                write_lock: Arc::new(Semaphore::new(1)),
                swap_lock: tokio::sync::Mutex::new(()),
                counters: ShardCounters::default(),
            }),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.inner.keyspace
    }

    pub fn shard(&self) -> &str {
        &self.inner.shard
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.inner.engine.read().kind()
    }

    fn engine(&self) -> Arc<dyn StorageEngine> {
        self.inner.engine.read().clone()
    }

    pub fn counters(&self) -> &ShardCounters {
        &self.inner.counters
    }

    /// Open transactions (active or prepared).
    pub fn open_transactions(&self) -> usize {
        self.inner
            .transactions
            .lock()
            .values()
            .filter(|slot| !slot.state.terminal())
            .count()
    }

    pub fn transaction_state(&self, id: u64) -> Option<TxState> {
        self.inner
            .transactions
            .lock()
            .get(&id)
            .map(|slot| slot.state)
    }

    /// Auto-commit read.
    pub async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        let engine = self.engine();
        let started = Instant::now();
        match engine.query(sql, params).await {
            Ok(result) => {
                self.inner
                    .counters
                    .record_query(started.elapsed().as_secs_f64() * 1000.0);
                Ok(result)
            }
            Err(err) => {
                self.inner.counters.record_error();
                Err(err.into())
            }
        }
    }

    /// Auto-commit write.
    pub async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        let engine = self.engine();
        let started = Instant::now();
        match engine.execute(sql, params).await {
            Ok(result) => {
                self.inner
                    .counters
                    .record_query(started.elapsed().as_secs_f64() * 1000.0);
                Ok(result)
            }
            Err(err) => {
                self.inner.counters.record_error();
                Err(err.into())
            }
        }
    }

    pub async fn schema(&self) -> Result<Vec<TableSchema>, Error> {
        Ok(self.engine().schema().await?)
    }

    pub fn status(&self) -> ShardHealth {
        ShardHealth {
            id: self.inner.shard.clone(),
            healthy: true,
            engine: self.engine_kind().as_str().into(),
            query_count: self.inner.counters.queries(),
            error_count: self.inner.counters.errors(),
            last_query: self.inner.counters.last_query(),
            latency: self.inner.counters.latency(),
        }
    }

    /// Open a transaction and register its handle.
    pub async fn begin(&self, options: TransactionOptions) -> Result<u64, Error> {
        let _swap = self.inner.swap_lock.lock().await;

        let open = self.open_transactions();
        if open >= self.inner.options.max_transactions {
            return Err(Error::TooManyTransactions {
                limit: self.inner.options.max_transactions,
            });
        }

        let engine = self.engine();
        let write = !options.read_only;
        // Single-writer engines serialize write transactions here;
        // readers never touch the lock.
        let write_permit = if write && engine.kind() == EngineKind::Sqlite {
            let permit = self
                .inner
                .write_lock
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Engine(crate::engine::Error::NotReady))?;
            Some(permit)
        } else {
            None
        };

        let engine_tx = engine.begin(options).await?;

        let deadline = options
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.inner.options.transaction_timeout)
            .map(|timeout| Instant::now() + timeout);

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.transactions.lock().insert(
            id,
            TransactionSlot {
                state: TxState::Active,
                engine_tx: Some(engine_tx),
                token: None,
                deadline,
                read_only: options.read_only,
                write_permit,
                operations: 0,
            },
        );
        Ok(id)
    }

    /// Take the engine half of an active handle out of its slot, expiring
    /// the handle first when its deadline has passed.
    fn gate(&self, id: u64) -> Result<Gate, Error> {
        let mut transactions = self.inner.transactions.lock();
        let slot = transactions
            .get_mut(&id)
            .ok_or(Error::TransactionNotFound(id))?;

        if slot.expired(Instant::now()) {
            let engine_tx = slot.engine_tx.take();
            let prepared_token = if slot.state == TxState::Prepared {
                slot.token.clone()
            } else {
                None
            };
            slot.state = TxState::Expired;
            slot.write_permit = None;
            return Ok(Gate::Expire {
                engine_tx,
                prepared_token,
            });
        }

        match slot.state {
            TxState::Active => {}
            TxState::Prepared => {
                return Err(Error::Engine(crate::engine::Error::Transaction(
                    "transaction is prepared; resolve it with its token".into(),
                )))
            }
            TxState::Expired => return Err(Error::Engine(crate::engine::Error::TransactionExpired)),
            TxState::Committed | TxState::RolledBack => {
                return Err(Error::Engine(crate::engine::Error::Transaction(
                    "transaction already finished".into(),
                )))
            }
        }

        let engine_tx = slot
            .engine_tx
            .take()
            .ok_or(Error::TransactionBusy { id })?;
        slot.operations += 1;
        Ok(Gate::Taken(engine_tx))
    }

    async fn take_active(&self, id: u64) -> Result<Box<dyn EngineTransaction>, Error> {
        match self.gate(id)? {
            Gate::Taken(engine_tx) => Ok(engine_tx),
            Gate::Expire {
                engine_tx,
                prepared_token,
            } => {
                self.expire(id, engine_tx, prepared_token).await;
                Err(Error::Engine(crate::engine::Error::TransactionExpired))
            }
        }
    }

    async fn expire(
        &self,
        id: u64,
        engine_tx: Option<Box<dyn EngineTransaction>>,
        prepared_token: Option<PrepareToken>,
    ) {
        warn!(id, shard = %self.inner.shard, "transaction expired, rolling back");
        if let Some(mut engine_tx) = engine_tx {
            if let Err(err) = engine_tx.rollback().await {
                warn!(%err, "rollback of expired transaction failed");
            }
        }
        if let Some(token) = prepared_token {
            if let Err(err) = self.engine().rollback_prepared(&token).await {
                warn!(%err, "rollback of expired prepared transaction failed");
            }
        }
    }

    fn put_back(&self, id: u64, engine_tx: Box<dyn EngineTransaction>) {
        if let Some(slot) = self.inner.transactions.lock().get_mut(&id) {
            slot.engine_tx = Some(engine_tx);
        }
    }

    pub async fn tx_query(
        &self,
        id: u64,
        sql: &str,
        params: &[Datum],
    ) -> Result<QueryResult, Error> {
        let mut engine_tx = self.take_active(id).await?;
        let result = engine_tx.query(sql, params).await;
        self.put_back(id, engine_tx);
        if result.is_err() {
            self.inner.counters.record_error();
        }
        Ok(result?)
    }

    pub async fn tx_execute(
        &self,
        id: u64,
        sql: &str,
        params: &[Datum],
    ) -> Result<ExecuteResult, Error> {
        let mut engine_tx = self.take_active(id).await?;
        let result = engine_tx.execute(sql, params).await;
        self.put_back(id, engine_tx);
        if result.is_err() {
            self.inner.counters.record_error();
        }
        Ok(result?)
    }

    fn finish(&self, id: u64, state: TxState) {
        if let Some(slot) = self.inner.transactions.lock().get_mut(&id) {
            slot.state = state;
            slot.engine_tx = None;
            slot.write_permit = None;
        }
    }

    /// Commit. Repeating a commit is a no-op; committing a rolled-back
    /// handle is an error.
    pub async fn commit(&self, id: u64) -> Result<(), Error> {
        {
            let transactions = self.inner.transactions.lock();
            let slot = transactions
                .get(&id)
                .ok_or(Error::TransactionNotFound(id))?;
            match slot.state {
                TxState::Committed => return Ok(()),
                TxState::RolledBack => {
                    return Err(Error::Engine(crate::engine::Error::Transaction(
                        "cannot commit a rolled-back transaction".into(),
                    )))
                }
                TxState::Expired => {
                    return Err(Error::Engine(crate::engine::Error::TransactionExpired))
                }
                TxState::Prepared => {
                    return Err(Error::Engine(crate::engine::Error::Transaction(
                        "transaction is prepared; use commit_prepared".into(),
                    )))
                }
                TxState::Active => {}
            }
        }

        let mut engine_tx = self.take_active(id).await?;
        match engine_tx.commit().await {
            Ok(()) => {
                self.finish(id, TxState::Committed);
                Ok(())
            }
            Err(err) => {
                // A failed commit aborts the transaction on the engine.
                self.finish(id, TxState::RolledBack);
                Err(err.into())
            }
        }
    }

    /// Roll back. Repeating is a no-op; rolling back a committed handle
    /// is an error. Engine-level rollback failures are swallowed.
    pub async fn rollback(&self, id: u64) -> Result<(), Error> {
        {
            let transactions = self.inner.transactions.lock();
            let slot = transactions
                .get(&id)
                .ok_or(Error::TransactionNotFound(id))?;
            match slot.state {
                TxState::RolledBack | TxState::Expired => return Ok(()),
                TxState::Committed => {
                    return Err(Error::Engine(crate::engine::Error::Transaction(
                        "cannot roll back a committed transaction".into(),
                    )))
                }
                TxState::Prepared => {
                    return Err(Error::Engine(crate::engine::Error::Transaction(
                        "transaction is prepared; use rollback_prepared".into(),
                    )))
                }
                TxState::Active => {}
            }
        }

        let mut engine_tx = self.take_active(id).await?;
        if let Err(err) = engine_tx.rollback().await {
            warn!(id, %err, "engine rollback failed");
        }
        self.finish(id, TxState::RolledBack);
        Ok(())
    }

    /// First phase of 2PC: persist the transaction under a fresh token.
    /// The prepare is durable on the engine before this returns.
    pub async fn prepare(&self, id: u64) -> Result<PrepareToken, Error> {
        let mut engine_tx = self.take_active(id).await?;
        let token = PrepareToken::new(&format!(
            "sgtx-{}-{}-{:08x}",
            self.inner.shard,
            id,
            rand::random::<u32>()
        ));

        match engine_tx.prepare(&token).await {
            Ok(()) => {
                let mut transactions = self.inner.transactions.lock();
                if let Some(slot) = transactions.get_mut(&id) {
                    slot.state = TxState::Prepared;
                    slot.token = Some(token.clone());
                    // The write permit stays held: the prepared
                    // transaction still owns its locks.
                }
                Ok(token)
            }
            Err(err) => {
                self.put_back(id, engine_tx);
                Err(err.into())
            }
        }
    }

    fn check_resolution(
        &self,
        id: u64,
        token: &PrepareToken,
        commit: bool,
    ) -> Result<Option<()>, Error> {
        let transactions = self.inner.transactions.lock();
        let slot = transactions
            .get(&id)
            .ok_or(Error::TransactionNotFound(id))?;
        if slot.expired(Instant::now()) {
            // Deadline passed while prepared: the stale token no longer
            // resolves. The reaper rolls the engine side back and
            // releases the locks.
            return Err(Error::Engine(crate::engine::Error::TransactionExpired));
        }
        match slot.state {
            TxState::Committed if commit => return Ok(None),
            TxState::RolledBack if !commit => return Ok(None),
            TxState::Committed | TxState::RolledBack => {
                return Err(Error::Engine(crate::engine::Error::Transaction(
                    "transaction resolved in the other direction".into(),
                )))
            }
            TxState::Expired => {
                return Err(Error::Engine(crate::engine::Error::TransactionExpired))
            }
            TxState::Active => {
                return Err(Error::Engine(crate::engine::Error::Transaction(
                    "transaction was never prepared".into(),
                )))
            }
            TxState::Prepared => {}
        }
        if slot.token.as_ref() != Some(token) {
            return Err(Error::Engine(crate::engine::Error::Transaction(
                "prepare token mismatch".into(),
            )));
        }
        Ok(Some(()))
    }

    /// Second phase of 2PC. Idempotent for the same direction; requires
    /// the exact token returned by `prepare`.
    pub async fn commit_prepared(&self, id: u64, token: &PrepareToken) -> Result<(), Error> {
        if self.check_resolution(id, token, true)?.is_none() {
            return Ok(());
        }
        self.engine().commit_prepared(token).await?;
        self.finish(id, TxState::Committed);
        Ok(())
    }

    pub async fn rollback_prepared(&self, id: u64, token: &PrepareToken) -> Result<(), Error> {
        if self.check_resolution(id, token, false)?.is_none() {
            return Ok(());
        }
        self.engine().rollback_prepared(token).await?;
        self.finish(id, TxState::RolledBack);
        Ok(())
    }

    /// Prepared transactions still pending on the engine, for recovery.
    pub async fn prepared_tokens(&self) -> Result<Vec<PrepareToken>, Error> {
        Ok(self.engine().prepared_transactions().await?)
    }

    /// Resolve a prepared transaction by token alone. Used by recovery,
    /// when the handle registry from before the restart is gone.
    pub async fn commit_prepared_token(&self, token: &PrepareToken) -> Result<(), Error> {
        Ok(self.engine().commit_prepared(token).await?)
    }

    pub async fn rollback_prepared_token(&self, token: &PrepareToken) -> Result<(), Error> {
        Ok(self.engine().rollback_prepared(token).await?)
    }

    /// Roll back every handle that outlived its deadline.
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<u64> = {
            let transactions = self.inner.transactions.lock();
            let now = Instant::now();
            transactions
                .iter()
                .filter(|(_, slot)| slot.expired(now))
                .map(|(id, _)| *id)
                .collect()
        };

        let mut reaped = 0;
        for id in expired {
            if let Ok(Gate::Expire {
                engine_tx,
                prepared_token,
            }) = self.gate(id)
            {
                self.expire(id, engine_tx, prepared_token).await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Probe the new engine, swap it in atomically, close the old one.
    /// Requires an empty transaction registry; new begins wait until the
    /// swap finishes.
    pub async fn switch_engine(&self, new_engine: Arc<dyn StorageEngine>) -> Result<(), Error> {
        let _swap = self.inner.swap_lock.lock().await;

        let open = self.open_transactions();
        if open > 0 {
            return Err(Error::SwapWithOpenTransactions { active: open });
        }

        new_engine
            .query("SELECT 1", &[])
            .await
            .map_err(Error::ProbeFailed)?;

        let old_engine = {
            let mut engine = self.inner.engine.write();
            std::mem::replace(&mut *engine, new_engine)
        };

        if let Err(err) = old_engine.close().await {
            warn!(shard = %self.inner.shard, %err, "closing replaced engine failed");
        }
        info!(shard = %self.inner.shard, engine = %self.engine_kind(), "engine switched");
        Ok(())
    }

    /// Roll back everything still open, clear the registry, close the
    /// engine. Best-effort throughout.
    pub async fn close(&self) {
        let open: Vec<(u64, TxState)> = {
            let transactions = self.inner.transactions.lock();
            transactions
                .iter()
                .filter(|(_, slot)| !slot.state.terminal())
                .map(|(id, slot)| (*id, slot.state))
                .collect()
        };

        for (id, state) in open {
            let result = match state {
                TxState::Prepared => {
                    let token = self
                        .inner
                        .transactions
                        .lock()
                        .get(&id)
                        .and_then(|slot| slot.token.clone());
                    match token {
                        Some(token) => self.rollback_prepared(id, &token).await,
                        None => Ok(()),
                    }
                }
                _ => self.rollback(id).await,
            };
            if let Err(err) = result {
                warn!(id, %err, "rollback during close failed");
            }
        }

        self.inner.transactions.lock().clear();
        if let Err(err) = self.engine().close().await {
            warn!(shard = %self.inner.shard, %err, "engine close failed");
        }
    }
}
