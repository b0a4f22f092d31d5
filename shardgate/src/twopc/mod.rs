//! Two-phase commit coordinator.
//!
//! One coordinator per gateway instance owns the gtid registry and the
//! durable prepare log. Participants enroll lazily on first use; prepare
//! and commit fan out in parallel under separate deadlines. A commit
//! decision exists exactly when the `Prepared` log record is on disk;
//! recovery after a crash commits those transactions and aborts
//! everything else.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{info, warn};

pub mod error;
pub mod log;

pub use error::Error;
pub use log::{LogRecord, ParticipantRecord, PrepareLog};

use crate::engine::{PrepareToken, TransactionOptions};
use crate::net::{Datum, ExecuteResult, QueryResult};
use crate::tablet::Tablet;

/// Where a distributed transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
    Completed,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub prepare_timeout: Duration,
    pub commit_timeout: Duration,
    /// Attempts per participant before commit reports incomplete.
    pub commit_retries: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(10),
            commit_retries: 3,
        }
    }
}

struct Dtx {
    participants: Vec<String>,
    handles: HashMap<String, u64>,
    tokens: HashMap<String, PrepareToken>,
    phase: Phase,
    options: TransactionOptions,
}

/// Outcome of the prepare phase.
#[derive(Debug)]
pub struct PrepareOutcome {
    pub success: bool,
    pub prepared: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Outcome of crash recovery.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub aborted: usize,
    /// Gtids still waiting on an unreachable participant.
    pub pending: Vec<String>,
}

struct Inner {
    tablets: HashMap<String, Tablet>,
    registry: DashMap<String, Dtx>,
    log: PrepareLog,
    counter: AtomicU64,
    options: CoordinatorOptions,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Keys are caller-chosen participant names, usually
    /// `keyspace.shard`, and must be unique across the gateway.
    pub fn new(
        tablets: impl IntoIterator<Item = (String, Tablet)>,
        log_path: &Path,
        options: CoordinatorOptions,
    ) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(Inner {
                tablets: tablets.into_iter().collect(),
                registry: DashMap::new(),
                log: PrepareLog::open(log_path)?,
                counter: AtomicU64::new(0),
                options,
            }),
        })
    }

    /// Open a distributed transaction with an empty participant set.
    pub fn begin(&self, options: TransactionOptions) -> String {
        let counter = self.inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let gtid = format!("gtid-{}-{:04x}", counter, rand::random::<u16>());
        self.inner.registry.insert(
            gtid.clone(),
            Dtx {
                participants: vec![],
                handles: HashMap::new(),
                tokens: HashMap::new(),
                phase: Phase::Prepare,
                options,
            },
        );
        gtid
    }

    pub fn phase(&self, gtid: &str) -> Option<Phase> {
        self.inner.registry.get(gtid).map(|dtx| dtx.phase)
    }

    pub fn participants(&self, gtid: &str) -> Vec<String> {
        self.inner
            .registry
            .get(gtid)
            .map(|dtx| dtx.participants.clone())
            .unwrap_or_default()
    }

    fn tablet(&self, shard: &str) -> Result<Tablet, Error> {
        self.inner
            .tablets
            .get(shard)
            .cloned()
            .ok_or_else(|| Error::UnknownShard(shard.into()))
    }

    /// Per-shard handle, opening the shard transaction on first use.
    async fn handle_for(&self, gtid: &str, shard: &str) -> Result<(Tablet, u64), Error> {
        let tablet = self.tablet(shard)?;

        let (existing, options) = {
            let dtx = self
                .inner
                .registry
                .get(gtid)
                .ok_or_else(|| Error::UnknownGtid(gtid.into()))?;
            (dtx.handles.get(shard).copied(), dtx.options)
        };
        if let Some(id) = existing {
            return Ok((tablet, id));
        }

        let id = tablet.begin(options).await?;
        let mut dtx = self
            .inner
            .registry
            .get_mut(gtid)
            .ok_or_else(|| Error::UnknownGtid(gtid.into()))?;
        dtx.participants.push(shard.to_string());
        dtx.handles.insert(shard.to_string(), id);
        Ok((tablet, id))
    }

    pub async fn execute_on(
        &self,
        gtid: &str,
        shard: &str,
        sql: &str,
        params: &[Datum],
    ) -> Result<ExecuteResult, Error> {
        let (tablet, id) = self.handle_for(gtid, shard).await?;
        Ok(tablet.tx_execute(id, sql, params).await?)
    }

    pub async fn query_on(
        &self,
        gtid: &str,
        shard: &str,
        sql: &str,
        params: &[Datum],
    ) -> Result<QueryResult, Error> {
        let (tablet, id) = self.handle_for(gtid, shard).await?;
        Ok(tablet.tx_query(id, sql, params).await?)
    }

    fn snapshot(&self, gtid: &str) -> Result<(Vec<(String, u64)>, HashMap<String, PrepareToken>, Phase), Error> {
        let dtx = self
            .inner
            .registry
            .get(gtid)
            .ok_or_else(|| Error::UnknownGtid(gtid.into()))?;
        let handles = dtx
            .participants
            .iter()
            .filter_map(|shard| dtx.handles.get(shard).map(|id| (shard.clone(), *id)))
            .collect();
        Ok((handles, dtx.tokens.clone(), dtx.phase))
    }

    /// Phase one: prepare every participant in parallel under the
    /// prepare deadline. On full success the commit decision is made
    /// durable before this returns.
    pub async fn prepare(&self, gtid: &str) -> Result<PrepareOutcome, Error> {
        let (handles, _, phase) = self.snapshot(gtid)?;
        if phase != Phase::Prepare {
            return Err(Error::NotPrepared { gtid: gtid.into() });
        }

        let deadline = self.inner.options.prepare_timeout;
        let attempts = handles.into_iter().map(|(shard, id)| {
            let tablet = self.tablet(&shard);
            async move {
                let result = match tablet {
                    Ok(tablet) => {
                        match tokio::time::timeout(deadline, tablet.prepare(id)).await {
                            Ok(Ok(token)) => Ok(token),
                            Ok(Err(err)) => Err(err.to_string()),
                            Err(_) => Err(format!("prepare timed out after {:?}", deadline)),
                        }
                    }
                    Err(err) => Err(err.to_string()),
                };
                (shard, result)
            }
        });

        let mut outcome = PrepareOutcome {
            success: true,
            prepared: vec![],
            failed: vec![],
        };
        let mut tokens = vec![];
        for (shard, result) in join_all(attempts).await {
            match result {
                Ok(token) => {
                    outcome.prepared.push(shard.clone());
                    tokens.push(ParticipantRecord { shard, token });
                }
                Err(reason) => {
                    outcome.success = false;
                    outcome.failed.push((shard, reason));
                }
            }
        }

        if outcome.success {
            // The decision to commit becomes durable here.
            self.inner.log.append(&LogRecord::Prepared {
                gtid: gtid.into(),
                participants: tokens.clone(),
            })?;
            if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
                for record in tokens {
                    dtx.tokens.insert(record.shard, record.token);
                }
            }
        } else {
            // Keep any tokens we did get so abort can resolve them.
            if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
                for record in tokens {
                    dtx.tokens.insert(record.shard, record.token);
                }
            }
        }

        Ok(outcome)
    }

    /// Phase two: drive every prepared participant to committed.
    /// Idempotent; on partial failure the phase stays `Commit` and the
    /// call can be repeated.
    pub async fn commit(&self, gtid: &str) -> Result<(), Error> {
        let (handles, tokens, phase) = self.snapshot(gtid)?;
        match phase {
            Phase::Completed => return Ok(()),
            Phase::Rollback => return Err(Error::AlreadyAborted { gtid: gtid.into() }),
            _ => {}
        }
        if tokens.len() != handles.len() {
            return Err(Error::NotPrepared { gtid: gtid.into() });
        }

        self.inner.log.append(&LogRecord::Commit { gtid: gtid.into() })?;
        if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
            dtx.phase = Phase::Commit;
        }

        let options = self.inner.options;
        let attempts = handles.into_iter().map(|(shard, id)| {
            let token = tokens.get(&shard).cloned();
            let tablet = self.tablet(&shard);
            async move {
                let Some(token) = token else {
                    return (shard, false);
                };
                let Ok(tablet) = tablet else {
                    return (shard, false);
                };
                for attempt in 0..options.commit_retries.max(1) {
                    match tokio::time::timeout(
                        options.commit_timeout,
                        tablet.commit_prepared(id, &token),
                    )
                    .await
                    {
                        Ok(Ok(())) => return (shard, true),
                        Ok(Err(err)) => {
                            warn!(%shard, attempt, %err, "commit-prepared failed, retrying")
                        }
                        Err(_) => warn!(%shard, attempt, "commit-prepared timed out, retrying"),
                    }
                }
                (shard, false)
            }
        });

        let failed: Vec<String> = join_all(attempts)
            .await
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(shard, _)| shard)
            .collect();

        if !failed.is_empty() {
            return Err(Error::CommitIncomplete {
                gtid: gtid.into(),
                failed,
            });
        }

        self.inner
            .log
            .append(&LogRecord::Completed { gtid: gtid.into() })?;
        if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
            dtx.phase = Phase::Completed;
            dtx.handles.clear();
        }
        info!(%gtid, "distributed transaction committed");
        Ok(())
    }

    /// Single-participant fast path: a plain commit on the one shard,
    /// no prepare round and no log record.
    pub async fn commit_single(&self, gtid: &str) -> Result<(), Error> {
        let (handles, _, phase) = self.snapshot(gtid)?;
        if phase == Phase::Completed {
            return Ok(());
        }
        if let Some((shard, id)) = handles.first() {
            let tablet = self.tablet(shard)?;
            tablet.commit(*id).await?;
        }
        if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
            dtx.phase = Phase::Completed;
            dtx.handles.clear();
        }
        Ok(())
    }

    /// Abort: plain rollback for unprepared participants, token rollback
    /// for prepared ones. Individual failures are logged; the abort
    /// always completes.
    pub async fn abort(&self, gtid: &str) -> Result<(), Error> {
        let (handles, tokens, phase) = self.snapshot(gtid)?;
        if phase == Phase::Completed {
            return Ok(());
        }

        self.inner.log.append(&LogRecord::Abort { gtid: gtid.into() })?;
        if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
            dtx.phase = Phase::Rollback;
        }

        for (shard, id) in handles {
            let Ok(tablet) = self.tablet(&shard) else {
                continue;
            };
            let result = match tokens.get(&shard) {
                Some(token) => tablet.rollback_prepared(id, token).await,
                None => tablet.rollback(id).await,
            };
            if let Err(err) = result {
                warn!(%shard, %gtid, %err, "rollback during abort failed");
            }
        }

        self.inner
            .log
            .append(&LogRecord::Completed { gtid: gtid.into() })?;
        if let Some(mut dtx) = self.inner.registry.get_mut(gtid) {
            dtx.phase = Phase::Completed;
            dtx.handles.clear();
        }
        info!(%gtid, "distributed transaction aborted");
        Ok(())
    }

    /// Finish whatever a crash left behind. Transactions with a durable
    /// `Prepared` record commit; engine-side prepared tokens with no
    /// record abort.
    pub async fn recover(&self) -> Result<RecoveryReport, Error> {
        #[derive(Default)]
        struct Replay {
            participants: Vec<ParticipantRecord>,
            abort: bool,
            completed: bool,
        }

        let mut replays: HashMap<String, Replay> = HashMap::new();
        let mut logged_tokens: Vec<PrepareToken> = vec![];
        for record in self.inner.log.read_all()? {
            let replay = replays.entry(record.gtid().to_string()).or_default();
            match record {
                LogRecord::Prepared { participants, .. } => {
                    logged_tokens.extend(participants.iter().map(|p| p.token.clone()));
                    replay.participants = participants;
                }
                LogRecord::Abort { .. } => replay.abort = true,
                LogRecord::Commit { .. } => {}
                LogRecord::Completed { .. } => replay.completed = true,
            }
        }

        let mut report = RecoveryReport::default();
        for (gtid, replay) in replays {
            if replay.completed || replay.participants.is_empty() {
                continue;
            }

            let mut unresolved = false;
            for participant in &replay.participants {
                let result = match self.tablet(&participant.shard) {
                    Ok(tablet) => {
                        if replay.abort {
                            tablet.rollback_prepared_token(&participant.token).await
                        } else {
                            tablet.commit_prepared_token(&participant.token).await
                        }
                    }
                    Err(err) => Err(crate::tablet::Error::from(
                        crate::engine::Error::ConnectionFailed(err.to_string()),
                    )),
                };
                if let Err(err) = result {
                    warn!(%gtid, shard = %participant.shard, %err, "recovery resolution failed");
                    unresolved = true;
                }
            }

            if unresolved {
                report.pending.push(gtid);
            } else {
                self.inner
                    .log
                    .append(&LogRecord::Completed { gtid: gtid.clone() })?;
                if replay.abort {
                    report.aborted += 1;
                } else {
                    report.committed += 1;
                }
                info!(
                    %gtid,
                    decision = if replay.abort { "abort" } else { "commit" },
                    "recovered in-doubt transaction"
                );
            }
        }

        // Tokens prepared on an engine but absent from the log belong to
        // transactions that crashed before the commit decision: abort.
        for tablet in self.inner.tablets.values() {
            let Ok(tokens) = tablet.prepared_tokens().await else {
                continue;
            };
            for token in tokens {
                if !logged_tokens.contains(&token) {
                    if let Err(err) = tablet.rollback_prepared_token(&token).await {
                        warn!(shard = %tablet.shard(), %err, "orphan rollback failed");
                    } else {
                        report.aborted += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::mock::MockBackend;
    use crate::engine::{PostgresEngine, SqliteEngine};

    fn postgres_tablet(shard: &str, mock: &MockBackend) -> Tablet {
        Tablet::new(
            "app",
            shard,
            Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
        )
    }

    fn coordinator(tablets: Vec<Tablet>, dir: &tempfile::TempDir) -> Coordinator {
        Coordinator::new(
            tablets
                .into_iter()
                .map(|tablet| (tablet.shard().to_string(), tablet)),
            &dir.path().join("prepare.log"),
            CoordinatorOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_two_participants() {
        let dir = tempfile::tempdir().unwrap();
        let (left, right) = (MockBackend::new(), MockBackend::new());
        let coordinator = coordinator(
            vec![postgres_tablet("-80", &left), postgres_tablet("80-", &right)],
            &dir,
        );

        let gtid = coordinator.begin(TransactionOptions::default());
        coordinator
            .execute_on(&gtid, "-80", "UPDATE t SET a = 1", &[])
            .await
            .unwrap();
        coordinator
            .execute_on(&gtid, "80-", "UPDATE t SET a = 2", &[])
            .await
            .unwrap();
        assert_eq!(coordinator.participants(&gtid).len(), 2);

        let outcome = coordinator.prepare(&gtid).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.prepared.len(), 2);

        coordinator.commit(&gtid).await.unwrap();
        assert_eq!(coordinator.phase(&gtid), Some(Phase::Completed));

        for mock in [&left, &right] {
            let commits = mock
                .sql_log()
                .iter()
                .filter(|sql| sql.starts_with("COMMIT PREPARED"))
                .count();
            assert_eq!(commits, 1);
        }

        // Committing again is a no-op.
        coordinator.commit(&gtid).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_failure_aborts_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let good = MockBackend::new();
        let bad = MockBackend::new().with_failure(
            "PREPARE TRANSACTION",
            crate::engine::BackendError::new("cannot prepare"),
        );
        let coordinator = coordinator(
            vec![postgres_tablet("-80", &good), postgres_tablet("80-", &bad)],
            &dir,
        );

        let gtid = coordinator.begin(TransactionOptions::default());
        coordinator
            .execute_on(&gtid, "-80", "UPDATE t SET a = 1", &[])
            .await
            .unwrap();
        coordinator
            .execute_on(&gtid, "80-", "UPDATE t SET a = 2", &[])
            .await
            .unwrap();

        let outcome = coordinator.prepare(&gtid).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.prepared, vec!["-80".to_string()]);
        assert_eq!(outcome.failed.len(), 1);

        coordinator.abort(&gtid).await.unwrap();
        assert_eq!(coordinator.phase(&gtid), Some(Phase::Completed));

        // The prepared participant was rolled back with its token, the
        // unprepared one with a plain rollback. Nothing committed.
        assert!(good
            .sql_log()
            .iter()
            .any(|sql| sql.starts_with("ROLLBACK PREPARED")));
        assert_eq!(bad.rollbacks(), 1);
        for mock in [&good, &bad] {
            assert!(!mock.sql_log().iter().any(|sql| sql.starts_with("COMMIT PREPARED")));
        }
    }

    #[tokio::test]
    async fn test_commit_before_prepare_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();
        let coordinator = coordinator(vec![postgres_tablet("-80", &mock)], &dir);

        let gtid = coordinator.begin(TransactionOptions::default());
        coordinator
            .execute_on(&gtid, "-80", "UPDATE t SET a = 1", &[])
            .await
            .unwrap();
        assert!(matches!(
            coordinator.commit(&gtid).await,
            Err(Error::NotPrepared { .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_retries_flaky_participant() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();
        let tablet = Tablet::new(
            "app",
            "-",
            Arc::new(SqliteEngine::new(Box::new(mock.clone()))),
        );
        let coordinator = coordinator(vec![tablet], &dir);

        let gtid = coordinator.begin(TransactionOptions::default());
        coordinator
            .execute_on(&gtid, "-", "UPDATE t SET a = 1", &[])
            .await
            .unwrap();
        let outcome = coordinator.prepare(&gtid).await.unwrap();
        assert!(outcome.success);

        // First commit attempt fails, the retry lands.
        mock.fail_commits(1);
        coordinator.commit(&gtid).await.unwrap();
        assert_eq!(mock.commits(), 1);
    }

    #[tokio::test]
    async fn test_single_shard_direct_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();
        let coordinator = coordinator(vec![postgres_tablet("-80", &mock)], &dir);

        let gtid = coordinator.begin(TransactionOptions::default());
        coordinator
            .execute_on(&gtid, "-80", "UPDATE t SET a = 1", &[])
            .await
            .unwrap();
        coordinator.commit_single(&gtid).await.unwrap();

        // Plain commit, no prepared-transaction statements.
        assert_eq!(mock.commits(), 1);
        assert!(!mock
            .sql_log()
            .iter()
            .any(|sql| sql.contains("PREPARE TRANSACTION")));
    }

    #[tokio::test]
    async fn test_recovery_commits_durable_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();

        // A coordinator prepared a transaction, then "crashed" before
        // commit: simulate by preparing through a first coordinator and
        // dropping it.
        {
            let coordinator = coordinator(vec![postgres_tablet("-80", &mock)], &dir);
            let gtid = coordinator.begin(TransactionOptions::default());
            coordinator
                .execute_on(&gtid, "-80", "UPDATE t SET a = 1", &[])
                .await
                .unwrap();
            assert!(coordinator.prepare(&gtid).await.unwrap().success);
        }

        // Fresh coordinator over the same log and tablets.
        let tablet = postgres_tablet("-80", &mock);
        let recovered = coordinator(vec![tablet], &dir);
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.aborted, 0);
        assert!(report.pending.is_empty());
        assert!(mock
            .sql_log()
            .iter()
            .any(|sql| sql.starts_with("COMMIT PREPARED")));

        // A second recovery pass finds nothing to do.
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.committed, 0);
    }

    #[tokio::test]
    async fn test_recovery_aborts_unlogged_prepares() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();
        let tablet = Tablet::new(
            "app",
            "-",
            Arc::new(SqliteEngine::new(Box::new(mock.clone()))),
        );

        // A prepare that never reached the coordinator log: crash
        // between participant prepare and the durable record.
        let orphan = tablet.begin(TransactionOptions::default()).await.unwrap();
        tablet.tx_execute(orphan, "UPDATE t SET a = 1", &[]).await.unwrap();
        tablet.prepare(orphan).await.unwrap();

        let coordinator = coordinator(vec![tablet], &dir);
        let report = coordinator.recover().await.unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.aborted, 1);
        assert_eq!(mock.rollbacks(), 1);
        assert_eq!(mock.commits(), 0);
    }
}
