//! The gateway.
//!
//! One logical database over many shards: statements are parsed just far
//! enough to route, dispatched in parallel, and reassembled through the
//! aggregation engine. Writes that span shards run under the two-phase
//! commit coordinator; single-shard transactions commit directly.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use shardgate_config::VSchema;

pub mod error;
pub mod parser;
pub mod planner;
pub mod rewrite;
pub mod route;

pub use error::Error;
pub use route::{LookupStep, PlanKind, QueryPlan, ShardRoute, ShardStatement};

use crate::aggregate::aggregate_results;
use crate::engine::{bind_placeholders, EngineKind, TransactionOptions};
use crate::net::{BatchResult, Datum, ExecuteResult, HealthReport, QueryResult};
use crate::sharding::{route_to_shard, LookupVindex};
use crate::stats::{ClusterStatus, TableSchema};
use crate::tablet::Tablet;
use crate::twopc::{Coordinator, CoordinatorOptions};

use parser::{PlannerValue, StatementInfo, StatementKind};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Per-shard deadline for every dispatched statement.
    pub query_timeout: Duration,
    /// Scatter reads tolerate failed shards, returning what succeeded.
    pub allow_partial: bool,
    pub twopc: CoordinatorOptions,
    pub twopc_log: PathBuf,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            allow_partial: false,
            twopc: CoordinatorOptions::default(),
            twopc_log: PathBuf::from("shardgate-2pc.log"),
        }
    }
}

/// A shard dropped from a partial scatter, with why.
#[derive(Debug, Clone)]
pub struct DegradedShard {
    pub shard: String,
    pub code: &'static str,
    pub message: String,
}

/// Scatter results under the allow-partial policy.
#[derive(Debug)]
pub struct ScatterOutcome {
    pub results: Vec<QueryResult>,
    pub degraded: Vec<DegradedShard>,
}

struct GatewayInner {
    vschema: VSchema,
    /// keyspace → tablets in shard order.
    tablets: HashMap<String, Vec<Tablet>>,
    coordinator: Coordinator,
    options: GatewayOptions,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

fn participant_key(keyspace: &str, shard: &str) -> String {
    format!("{}.{}", keyspace, shard)
}

impl Gateway {
    /// Validate the vschema and wire up tablets and the coordinator.
    pub fn new(
        vschema: VSchema,
        tablets: Vec<Tablet>,
        options: GatewayOptions,
    ) -> Result<Self, Error> {
        let outcome = vschema.validate();
        if !outcome.valid() {
            let errors: Vec<String> = outcome
                .errors
                .iter()
                .map(|error| error.to_string())
                .collect();
            return Err(Error::InvalidVSchema(errors.join("; ")));
        }

        let coordinator = Coordinator::new(
            tablets
                .iter()
                .map(|tablet| {
                    (
                        participant_key(tablet.keyspace(), tablet.shard()),
                        tablet.clone(),
                    )
                })
                .collect::<Vec<_>>(),
            &options.twopc_log,
            options.twopc,
        )?;

        let mut grouped: HashMap<String, Vec<Tablet>> = HashMap::new();
        for tablet in tablets {
            grouped
                .entry(tablet.keyspace().to_string())
                .or_default()
                .push(tablet);
        }

        Ok(Self {
            inner: Arc::new(GatewayInner {
                vschema,
                tablets: grouped,
                coordinator,
                options,
            }),
        })
    }

    pub fn vschema(&self) -> &VSchema {
        &self.inner.vschema
    }

    fn tablet(&self, keyspace: &str, shard: &str) -> Result<Tablet, Error> {
        self.inner
            .tablets
            .get(keyspace)
            .and_then(|tablets| tablets.iter().find(|tablet| tablet.shard() == shard))
            .cloned()
            .ok_or_else(|| Error::NoTablet {
                keyspace: keyspace.into(),
                shard: shard.into(),
            })
    }

    fn prepare_plan(&self, sql: &str, params: &[Datum]) -> Result<(StatementInfo, QueryPlan), Error> {
        // Normalize `?` placeholders to `$n` so the planner sees stable
        // indices; this also validates the parameter list.
        let (normalized, _) = bind_placeholders(sql, params, EngineKind::Postgres)
            .map_err(crate::tablet::Error::from)?;
        let info = parser::analyze(&normalized)?;
        let plan = planner::plan(&self.inner.vschema, &normalized, &info, params)?;
        debug!(kind = ?plan.kind, shards = plan.shards.len(), "planned statement");
        Ok((info, plan))
    }

    /// Routing decision for a statement.
    pub fn route(&self, sql: &str, params: &[Datum]) -> Result<ShardRoute, Error> {
        Ok(self.prepare_plan(sql, params)?.1.route())
    }

    /// Full plan for a statement.
    pub fn plan(&self, sql: &str, params: &[Datum]) -> Result<QueryPlan, Error> {
        Ok(self.prepare_plan(sql, params)?.1)
    }

    async fn shard_query(
        &self,
        keyspace: &str,
        shard: &str,
        sql: &str,
        params: &[Datum],
    ) -> Result<QueryResult, Error> {
        let timeout = self.inner.options.query_timeout;
        let tablet = self.tablet(keyspace, shard)?;
        match tokio::time::timeout(timeout, tablet.query(sql, params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(source)) => Err(Error::Shard {
                shard: shard.into(),
                source,
            }),
            Err(_) => Err(Error::Timeout {
                shard: shard.into(),
                after: timeout,
            }),
        }
    }

    async fn shard_execute(
        &self,
        keyspace: &str,
        shard: &str,
        sql: &str,
        params: &[Datum],
    ) -> Result<ExecuteResult, Error> {
        let timeout = self.inner.options.query_timeout;
        let tablet = self.tablet(keyspace, shard)?;
        match tokio::time::timeout(timeout, tablet.execute(sql, params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(source)) => Err(Error::Shard {
                shard: shard.into(),
                source,
            }),
            Err(_) => Err(Error::Timeout {
                shard: shard.into(),
                after: timeout,
            }),
        }
    }

    /// Dispatch a plan to all its shards in parallel; any shard failure
    /// fails the call with the shard attached.
    pub async fn scatter(&self, plan: &QueryPlan) -> Result<Vec<QueryResult>, Error> {
        let dispatches = plan.shards.iter().map(|shard| {
            self.shard_query(&plan.keyspace, shard, &plan.sql, &plan.params)
        });
        join_all(dispatches).await.into_iter().collect()
    }

    /// Scatter that tolerates failed shards, reporting them alongside
    /// the successful results.
    pub async fn scatter_partial(&self, plan: &QueryPlan) -> ScatterOutcome {
        let dispatches = plan.shards.iter().map(|shard| async move {
            (
                shard.clone(),
                self.shard_query(&plan.keyspace, shard, &plan.sql, &plan.params)
                    .await,
            )
        });

        let mut outcome = ScatterOutcome {
            results: vec![],
            degraded: vec![],
        };
        for (shard, result) in join_all(dispatches).await {
            match result {
                Ok(result) => outcome.results.push(result),
                Err(error) => {
                    warn!(%shard, %error, "scatter shard degraded");
                    outcome.degraded.push(DegradedShard {
                        shard,
                        code: error.code(),
                        message: error.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// Resolve a lookup plan to its target shards. Empty means no row
    /// maps to the value.
    async fn resolve_lookup(&self, plan: &QueryPlan) -> Result<Vec<String>, Error> {
        let step = plan
            .lookup
            .as_ref()
            .ok_or_else(|| Error::Parse("lookup plan without a lookup step".into()))?;

        let keyspace = self
            .inner
            .vschema
            .keyspace(&plan.keyspace)
            .ok_or_else(|| Error::KeyspaceNotFound(plan.keyspace.clone()))?;
        let def = keyspace
            .vindexes
            .get(&step.vindex)
            .ok_or_else(|| Error::UnknownVindex {
                table: plan.keyspace.clone(),
                vindex: step.vindex.clone(),
            })?;
        let lookup = LookupVindex::from_def(def).ok_or_else(|| Error::UnknownVindex {
            table: plan.keyspace.clone(),
            vindex: step.vindex.clone(),
        })?;

        let lookup_shards = self.inner.vschema.shards(&step.keyspace)?;
        let result = self
            .shard_query(
                &step.keyspace,
                &lookup_shards[0],
                &lookup.select_sql(),
                std::slice::from_ref(&step.value),
            )
            .await?;

        let ranges = keyspace.key_ranges()?;
        let shard_names = keyspace.shard_names();
        let mut shards: Vec<String> = vec![];
        for row in &result.rows {
            let Some(id) = row.get(lookup.to_column()).and_then(|datum| datum.as_i64()) else {
                continue;
            };
            let index = route_to_shard(id as u64, &ranges)?;
            if !shards.contains(&shard_names[index]) {
                shards.push(shard_names[index].clone());
            }
        }
        Ok(shards)
    }

    /// Route and run a read, reassembling cross-shard results.
    pub async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        let (_, plan) = self.prepare_plan(sql, params)?;
        if plan.write {
            return Err(Error::Unsupported(
                "write statement passed to query; use execute".into(),
            ));
        }
        self.dispatch_read(plan).await
    }

    async fn dispatch_read(&self, mut plan: QueryPlan) -> Result<QueryResult, Error> {
        if plan.kind == PlanKind::Lookup {
            let shards = self.resolve_lookup(&plan).await?;
            if shards.is_empty() {
                return Ok(QueryResult::empty());
            }
            plan.kind = if shards.len() == 1 {
                PlanKind::SingleShard
            } else {
                PlanKind::MultiShard
            };
            plan.shards = shards;
        }

        if plan.shards.len() == 1 {
            return self
                .shard_query(&plan.keyspace, &plan.shards[0], &plan.sql, &plan.params)
                .await;
        }

        let context = plan.aggregation.clone().unwrap_or_default();
        let results = if self.inner.options.allow_partial {
            let outcome = self.scatter_partial(&plan).await;
            if outcome.results.is_empty() {
                if let Some(degraded) = outcome.degraded.into_iter().next() {
                    return Err(Error::ShardWrite {
                        shard: degraded.shard,
                        reason: degraded.message,
                    });
                }
                vec![]
            } else {
                outcome.results
            }
        } else {
            self.scatter(&plan).await?
        };
        Ok(aggregate_results(results, &context)?)
    }

    /// Route and run a write. Auto-increment columns fill from their
    /// sequence before planning, so an insert may omit even a sharding
    /// key that a sequence backs.
    pub async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        let (normalized, _) = bind_placeholders(sql, params, EngineKind::Postgres)
            .map_err(crate::tablet::Error::from)?;
        let mut info = parser::analyze(&normalized)?;
        self.inject_auto_increment(&mut info).await?;
        let plan = planner::plan(&self.inner.vschema, &normalized, &info, params)?;
        self.dispatch_write(plan).await
    }

    async fn dispatch_write(&self, mut plan: QueryPlan) -> Result<ExecuteResult, Error> {
        if plan.kind == PlanKind::Lookup {
            let shards = self.resolve_lookup(&plan).await?;
            if shards.is_empty() {
                return Ok(ExecuteResult::new(0));
            }
            plan.shards = shards;
        }

        if let Some(statements) = plan.per_shard.clone() {
            let dispatches = statements.iter().map(|statement| {
                self.shard_execute(
                    &plan.keyspace,
                    &statement.shard,
                    &statement.sql,
                    &statement.params,
                )
            });
            let results: Result<Vec<ExecuteResult>, Error> =
                join_all(dispatches).await.into_iter().collect();
            let affected = results?.iter().map(|result| result.affected).sum();
            // Multi-shard inserts do not surface last_insert_id.
            return Ok(ExecuteResult::new(affected));
        }

        if plan.shards.len() == 1 {
            return self
                .shard_execute(&plan.keyspace, &plan.shards[0], &plan.sql, &plan.params)
                .await;
        }

        let dispatches = plan.shards.iter().map(|shard| {
            self.shard_execute(&plan.keyspace, shard, &plan.sql, &plan.params)
        });
        let results: Result<Vec<ExecuteResult>, Error> =
            join_all(dispatches).await.into_iter().collect();
        let affected = results?.iter().map(|result| result.affected).sum();
        Ok(ExecuteResult::new(affected))
    }

    /// Fill a missing auto-increment column from its sequence table.
    async fn inject_auto_increment(&self, info: &mut StatementInfo) -> Result<(), Error> {
        if info.kind != StatementKind::Insert {
            return Ok(());
        }
        let Some(table_name) = info.table.clone() else {
            return Ok(());
        };
        let table = match &info.keyspace {
            Some(keyspace) => self.inner.vschema.table(keyspace, &table_name),
            None => self
                .inner
                .vschema
                .find_table(&table_name)
                .map(|(_, _, table)| table),
        };
        let Some(auto) = table.and_then(|table| table.auto_increment.clone()) else {
            return Ok(());
        };
        let Some(insert) = info.insert.as_mut() else {
            return Ok(());
        };
        if insert.columns.iter().any(|column| *column == auto.column) {
            return Ok(());
        }

        let start = self
            .next_sequence_values(&auto.sequence, insert.rows.len())
            .await?;
        insert.columns.push(auto.column.clone());
        for (index, row) in insert.rows.iter_mut().enumerate() {
            row.push(PlannerValue::Literal(Datum::Bigint(start + index as i64)));
        }
        Ok(())
    }

    /// Reserve `count` values from a sequence table, returning the first.
    async fn next_sequence_values(&self, reference: &str, count: usize) -> Result<i64, Error> {
        let (keyspace, _) = self
            .inner
            .vschema
            .resolve_sequence(reference)
            .ok_or_else(|| Error::TableNotFound(reference.into()))?;
        let keyspace = keyspace.to_string();
        let table = reference
            .rsplit_once('.')
            .map(|(_, table)| table)
            .unwrap_or(reference)
            .to_string();

        let shards = self.inner.vschema.shards(&keyspace)?;
        let tablet = self.tablet(&keyspace, &shards[0])?;

        let tx = tablet.begin(TransactionOptions::default()).await?;
        let reserve = async {
            let current = tablet
                .tx_query(tx, &format!("SELECT next_id FROM {}", table), &[])
                .await?;
            let value = current
                .scalar("next_id")
                .and_then(|datum| datum.as_i64())
                .ok_or_else(|| {
                    Error::Parse(format!("sequence \"{}\" has no next_id", table))
                })?;
            tablet
                .tx_execute(
                    tx,
                    &format!("UPDATE {} SET next_id = next_id + {}", table, count),
                    &[],
                )
                .await?;
            tablet.commit(tx).await?;
            Ok(value)
        }
        .await;

        if reserve.is_err() {
            let _ = tablet.rollback(tx).await;
        }
        reserve
    }

    /// Run statements in order, stopping at the first failure.
    pub async fn batch(&self, statements: &[(String, Vec<Datum>)]) -> BatchResult {
        let mut batch = BatchResult {
            success: true,
            ..Default::default()
        };

        for (index, (sql, params)) in statements.iter().enumerate() {
            let outcome = match self.prepare_plan(sql, params) {
                Ok((_, plan)) if plan.write => {
                    self.execute(sql, params).await.map(|result| QueryResult {
                        row_count: result.affected as usize,
                        ..Default::default()
                    })
                }
                Ok(_) => self.query(sql, params).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(result) => batch.results.push(result),
                Err(err) => {
                    batch.success = false;
                    batch.failed_at = Some(index);
                    batch.error = Some(err.to_string());
                    break;
                }
            }
        }
        batch
    }

    /// Run `body` inside a distributed transaction. Normal return
    /// prepares then commits; any error aborts. A transaction touching
    /// one shard commits directly without the prepare round.
    pub async fn transaction<F, Fut, T>(
        &self,
        options: TransactionOptions,
        body: F,
    ) -> Result<T, Error>
    where
        F: FnOnce(TxnSession) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let coordinator = &self.inner.coordinator;
        let gtid = coordinator.begin(options);
        let session = TxnSession {
            gateway: self.clone(),
            gtid: gtid.clone(),
        };

        match body(session).await {
            Ok(value) => {
                if coordinator.participants(&gtid).len() <= 1 {
                    coordinator.commit_single(&gtid).await?;
                    return Ok(value);
                }
                let outcome = coordinator.prepare(&gtid).await?;
                if !outcome.success {
                    let (shard, reason) = outcome
                        .failed
                        .into_iter()
                        .next()
                        .unwrap_or_default();
                    coordinator.abort(&gtid).await?;
                    return Err(Error::ShardWrite { shard, reason });
                }
                coordinator.commit(&gtid).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = coordinator.abort(&gtid).await {
                    warn!(%gtid, %abort_err, "abort after failed transaction body");
                }
                Err(err)
            }
        }
    }

    /// Cluster status for one keyspace.
    pub fn status(&self, keyspace: &str) -> Result<ClusterStatus, Error> {
        let tablets = self
            .inner
            .tablets
            .get(keyspace)
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.into()))?;
        let shards: Vec<_> = tablets.iter().map(|tablet| tablet.status()).collect();
        Ok(ClusterStatus {
            keyspace: keyspace.into(),
            shard_count: tablets.len(),
            engine: tablets
                .first()
                .map(|tablet| tablet.engine_kind().as_str().to_string())
                .unwrap_or_default(),
            total_queries: shards.iter().map(|shard| shard.query_count).sum(),
            total_errors: shards.iter().map(|shard| shard.error_count).sum(),
            shards,
        })
    }

    pub fn health(&self) -> HealthReport {
        let total: usize = self.inner.tablets.values().map(|tablets| tablets.len()).sum();
        let healthy = self
            .inner
            .tablets
            .values()
            .flatten()
            .filter(|tablet| tablet.status().healthy)
            .count();
        HealthReport {
            healthy: healthy == total,
            shards_total: total,
            shards_healthy: healthy,
        }
    }

    /// Table schema of a keyspace, read from its first shard.
    pub async fn schema(&self, keyspace: &str) -> Result<Vec<TableSchema>, Error> {
        let shards = self.inner.vschema.shards(keyspace)?;
        let tablet = self.tablet(keyspace, &shards[0])?;
        Ok(tablet.schema().await?)
    }

    /// Finish in-doubt distributed transactions after a restart.
    pub async fn recover(&self) -> Result<crate::twopc::RecoveryReport, Error> {
        Ok(self.inner.coordinator.recover().await?)
    }
}

/// Handle passed to a transaction body; statements routed through it run
/// on per-shard transaction handles owned by the distributed
/// transaction.
#[derive(Clone)]
pub struct TxnSession {
    gateway: Gateway,
    gtid: String,
}

impl TxnSession {
    pub fn gtid(&self) -> &str {
        &self.gtid
    }

    pub async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, Error> {
        let (_, plan) = self.gateway.prepare_plan(sql, params)?;
        let coordinator = &self.gateway.inner.coordinator;

        let mut results = vec![];
        for shard in &plan.shards {
            let key = participant_key(&plan.keyspace, shard);
            results.push(
                coordinator
                    .query_on(&self.gtid, &key, &plan.sql, &plan.params)
                    .await?,
            );
        }
        let context = plan.aggregation.clone().unwrap_or_default();
        Ok(aggregate_results(results, &context)?)
    }

    pub async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, Error> {
        let (normalized, _) = bind_placeholders(sql, params, EngineKind::Postgres)
            .map_err(crate::tablet::Error::from)?;
        let mut info = parser::analyze(&normalized)?;
        self.gateway.inject_auto_increment(&mut info).await?;
        let plan = planner::plan(&self.gateway.inner.vschema, &normalized, &info, params)?;
        let coordinator = &self.gateway.inner.coordinator;

        if let Some(statements) = &plan.per_shard {
            let mut affected = 0;
            for statement in statements {
                let key = participant_key(&plan.keyspace, &statement.shard);
                affected += coordinator
                    .execute_on(&self.gtid, &key, &statement.sql, &statement.params)
                    .await?
                    .affected;
            }
            return Ok(ExecuteResult::new(affected));
        }

        let mut affected = 0;
        let mut last_insert_id = None;
        for shard in &plan.shards {
            let key = participant_key(&plan.keyspace, shard);
            let result = coordinator
                .execute_on(&self.gtid, &key, &plan.sql, &plan.params)
                .await?;
            affected += result.affected;
            last_insert_id = result.last_insert_id;
        }
        Ok(ExecuteResult {
            affected,
            last_insert_id: if plan.shards.len() == 1 {
                last_insert_id
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::mock::MockBackend;
    use crate::engine::PostgresEngine;
    use crate::net::{row, Field};
    use shardgate_config::{HashFunction, KeyRange, VSchema, VindexDef};

    fn shard_of(id: i64, shards: &[&str]) -> String {
        let key = crate::sharding::hash_key(HashFunction::Md5, &Datum::Bigint(id)).unwrap();
        let ranges: Vec<KeyRange> = shards.iter().map(|s| s.parse().unwrap()).collect();
        shards[route_to_shard(key, &ranges).unwrap()].to_string()
    }

    fn app_vschema(shards: &[&str]) -> VSchema {
        VSchema::builder()
            .sharded_keyspace("app", shards)
            .vindex("app", "uhash", VindexDef::hash())
            .table("app", "users", &[("id", "uhash")])
            .table("app", "orders", &[("user_id", "uhash")])
            .build()
    }

    fn build_gateway(
        shards: &[&str],
        mocks: &[MockBackend],
        dir: &tempfile::TempDir,
    ) -> Gateway {
        build_gateway_opts(shards, mocks, dir, GatewayOptions::default())
    }

    fn build_gateway_opts(
        shards: &[&str],
        mocks: &[MockBackend],
        dir: &tempfile::TempDir,
        mut options: GatewayOptions,
    ) -> Gateway {
        options.twopc_log = dir.path().join("2pc.log");
        let tablets = shards
            .iter()
            .zip(mocks)
            .map(|(shard, mock)| {
                Tablet::new(
                    "app",
                    shard,
                    Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
                )
            })
            .collect();
        Gateway::new(app_vschema(shards), tablets, options).unwrap()
    }

    const TWO: [&str; 2] = ["-80", "80-"];
    const FOUR: [&str; 4] = ["-40", "40-80", "80-c0", "c0-"];

    fn mocks(count: usize) -> Vec<MockBackend> {
        (0..count).map(|_| MockBackend::new()).collect()
    }

    #[tokio::test]
    async fn test_point_query_routes_to_one_shard() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let route = gateway
            .route("SELECT * FROM users WHERE id = $1", &[Datum::Bigint(123)])
            .unwrap();
        assert_eq!(route.keyspace, "app");
        assert_eq!(route.shards.len(), 1);
        assert!(!route.is_scatter);
        assert_eq!(route.shards[0], shard_of(123, &TWO));

        let plan = gateway
            .plan("SELECT * FROM users WHERE id = $1", &[Datum::Bigint(123)])
            .unwrap();
        assert_eq!(plan.kind, PlanKind::SingleShard);
    }

    #[tokio::test]
    async fn test_unknown_table_and_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let err = gateway.route("SELECT * FROM nope", &[]).unwrap_err();
        assert_eq!(err.code(), "TABLE_NOT_FOUND");

        let err = gateway.route("SELECT * FROM ghost.users", &[]).unwrap_err();
        assert_eq!(err.code(), "KEYSPACE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_count_across_four_shards() {
        let dir = tempfile::tempdir().unwrap();
        let partials = [100_i64, 200, 150, 50];
        let shard_mocks: Vec<MockBackend> = partials
            .iter()
            .map(|count| {
                MockBackend::new().with_rows(
                    "COUNT(*)",
                    QueryResult::new(
                        vec![Field::bigint("count")],
                        vec![row(&[("count", Datum::Bigint(*count))])],
                    ),
                )
            })
            .collect();
        let gateway = build_gateway(&FOUR, &shard_mocks, &dir);

        let result = gateway
            .query("SELECT COUNT(*) AS count FROM users", &[])
            .await
            .unwrap_or_else(|err| panic!("{}", err));
        assert_eq!(result.row_count, 1);
        assert_eq!(result.scalar("count"), Some(&Datum::Bigint(500)));
    }

    #[tokio::test]
    async fn test_avg_merges_from_sum_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let partials = [(30_i64, 2_i64), (40, 8), (0, 0), (0, 0)];
        let shard_mocks: Vec<MockBackend> = partials
            .iter()
            .map(|(sum, count)| {
                MockBackend::new().with_rows(
                    "SUM(value)",
                    QueryResult::new(
                        vec![Field::bigint("__sg_sum_1"), Field::bigint("__sg_count_1")],
                        vec![row(&[
                            ("__sg_sum_1", Datum::Bigint(*sum)),
                            ("__sg_count_1", Datum::Bigint(*count)),
                        ])],
                    ),
                )
            })
            .collect();
        let gateway = build_gateway(&FOUR, &shard_mocks, &dir);

        let result = gateway
            .query("SELECT AVG(value) AS avg FROM users", &[])
            .await
            .unwrap();
        // 70 / 10 = 7, not the average of per-shard averages.
        assert_eq!(result.scalar("avg"), Some(&Datum::Bigint(7)));
    }

    #[tokio::test]
    async fn test_order_by_limit_k_way_merge() {
        let dir = tempfile::tempdir().unwrap();
        let streams = [vec![1_i64, 5, 9], vec![2, 4, 8], vec![3, 6, 7]];
        let shard_mocks: Vec<MockBackend> = streams
            .iter()
            .map(|ids| {
                MockBackend::new().with_rows(
                    "ORDER BY id",
                    QueryResult::new(
                        vec![Field::bigint("id")],
                        ids.iter().map(|id| row(&[("id", Datum::Bigint(*id))])).collect(),
                    ),
                )
            })
            .collect();
        let gateway = build_gateway(&["-55", "55-aa", "aa-"], &shard_mocks, &dir);

        let result = gateway
            .query("SELECT id FROM users ORDER BY id LIMIT 3", &[])
            .await
            .unwrap();
        assert_eq!(
            result.column("id"),
            vec![Datum::Bigint(1), Datum::Bigint(2), Datum::Bigint(3)]
        );

        let result = gateway
            .query("SELECT id FROM users ORDER BY id LIMIT 9", &[])
            .await
            .unwrap();
        assert_eq!(
            result.column("id"),
            (1..=9).map(Datum::Bigint).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_in_list_routes_to_subset() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&FOUR, &mocks(4), &dir);

        let (a, b) = (11_i64, 12_i64);
        let mut expected = vec![shard_of(a, &FOUR)];
        let shard_b = shard_of(b, &FOUR);
        if !expected.contains(&shard_b) {
            expected.push(shard_b);
        }

        let route = gateway
            .route(
                "SELECT * FROM users WHERE id IN ($1, $2)",
                &[Datum::Bigint(a), Datum::Bigint(b)],
            )
            .unwrap();
        assert_eq!(route.shards, expected);
        assert!(!route.is_scatter);
    }

    #[tokio::test]
    async fn test_update_without_key_scatters() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let route = gateway
            .route("UPDATE users SET name = 'x'", &[])
            .unwrap();
        assert!(route.is_scatter);

        let result = gateway
            .execute("UPDATE users SET name = 'x'", &[])
            .await
            .unwrap_or_else(|err| panic!("{}", err));
        assert_eq!(result.affected, 2);
    }

    #[tokio::test]
    async fn test_insert_requires_sharding_key() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let err = gateway
            .execute("INSERT INTO users (name) VALUES ('a')", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SHARDING_KEY_REQUIRED");
    }

    #[tokio::test]
    async fn test_single_row_insert_hits_one_shard() {
        let dir = tempfile::tempdir().unwrap();
        let shard_mocks = mocks(2);
        let gateway = build_gateway(&TWO, &shard_mocks, &dir);

        gateway
            .execute(
                "INSERT INTO users (id, name) VALUES ($1, $2)",
                &[Datum::Bigint(42), Datum::Text("ann".into())],
            )
            .await
            .unwrap();

        let inserts: usize = shard_mocks
            .iter()
            .map(|mock| {
                mock.sql_log()
                    .iter()
                    .filter(|sql| sql.starts_with("INSERT"))
                    .count()
            })
            .sum();
        assert_eq!(inserts, 1);

        let target = shard_of(42, &TWO);
        let index = TWO.iter().position(|shard| *shard == target).unwrap();
        assert!(shard_mocks[index]
            .sql_log()
            .iter()
            .any(|sql| sql.starts_with("INSERT")));
    }

    #[tokio::test]
    async fn test_multi_row_insert_groups_by_shard() {
        let dir = tempfile::tempdir().unwrap();
        let shard_mocks = mocks(2);
        let gateway = build_gateway(&TWO, &shard_mocks, &dir);

        let ids = [1_i64, 2, 3, 4, 5, 6];
        let values: Vec<String> = ids
            .iter()
            .map(|id| format!("({}, 'user{}')", id, id))
            .collect();
        let sql = format!(
            "INSERT INTO users (id, name) VALUES {}",
            values.join(", ")
        );
        let result = gateway.execute(&sql, &[]).await.unwrap();
        assert_eq!(result.affected as usize, {
            // Each shard's mock reports one execution of affected=1.
            let mut shards: Vec<String> = ids.iter().map(|id| shard_of(*id, &TWO)).collect();
            shards.sort();
            shards.dedup();
            shards.len()
        });

        // Every row landed on the shard its id hashes to.
        for (index, shard) in TWO.iter().enumerate() {
            let expected: usize = ids
                .iter()
                .filter(|id| shard_of(**id, &TWO) == *shard)
                .count();
            let params = shard_mocks[index].params_log();
            let inserted = params.first().map(|p| p.len() / 2).unwrap_or(0);
            assert_eq!(inserted, expected, "shard {}", shard);
        }
    }

    #[tokio::test]
    async fn test_truncate_and_set_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);
        assert_eq!(
            gateway.route("TRUNCATE TABLE users", &[]).unwrap_err().code(),
            "UNSUPPORTED"
        );
        assert_eq!(
            gateway.route("SET search_path = 'x'", &[]).unwrap_err().code(),
            "UNSUPPORTED"
        );
    }

    #[tokio::test]
    async fn test_query_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);
        let err = gateway
            .query("DELETE FROM users WHERE id = 1", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_colocated_join_routes_single_shard() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let route = gateway
            .route(
                "SELECT * FROM orders JOIN users ON orders.user_id = users.id \
                 WHERE users.id = 5",
                &[],
            )
            .unwrap();
        assert_eq!(route.shards, vec![shard_of(5, &TWO)]);

        // Without a bound value the join scatters.
        let route = gateway
            .route(
                "SELECT * FROM orders JOIN users ON orders.user_id = users.id",
                &[],
            )
            .unwrap();
        assert!(route.is_scatter);
    }

    #[tokio::test]
    async fn test_shard_failure_carries_shard_id() {
        let dir = tempfile::tempdir().unwrap();
        let good = MockBackend::new();
        let bad = MockBackend::new().with_failure(
            "SELECT",
            crate::engine::BackendError::with_sql_state("boom", "42703"),
        );
        let gateway = build_gateway(&TWO, &[good, bad], &dir);

        let err = gateway.query("SELECT id FROM users", &[]).await.unwrap_err();
        assert_eq!(err.shard(), Some("80-"));
        assert_eq!(err.code(), "QUERY_ERROR");
    }

    #[tokio::test]
    async fn test_allow_partial_returns_surviving_shards() {
        let dir = tempfile::tempdir().unwrap();
        let good = MockBackend::new().with_rows(
            "SELECT id",
            QueryResult::new(
                vec![Field::bigint("id")],
                vec![row(&[("id", Datum::Bigint(1))])],
            ),
        );
        let bad = MockBackend::new().with_failure(
            "SELECT",
            crate::engine::BackendError::new("down"),
        );
        let gateway = build_gateway_opts(
            &TWO,
            &[good, bad],
            &dir,
            GatewayOptions {
                allow_partial: true,
                ..Default::default()
            },
        );

        let result = gateway.query("SELECT id FROM users", &[]).await.unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[tokio::test]
    async fn test_per_shard_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let slow = MockBackend::new().with_delay_ms(200);
        let gateway = build_gateway_opts(
            &TWO,
            &[slow, MockBackend::new()],
            &dir,
            GatewayOptions {
                query_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let err = gateway.query("SELECT id FROM users", &[]).await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.shard(), Some("-80"));
    }

    #[tokio::test]
    async fn test_lookup_vindex_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        // Keyspace id 1 lives in "-80".
        let lookup_mock = MockBackend::new().with_rows(
            "SELECT keyspace_id FROM users_by_email",
            QueryResult::new(
                vec![Field::bigint("keyspace_id")],
                vec![row(&[("keyspace_id", Datum::Bigint(1))])],
            ),
        );
        let shard_mocks = mocks(2);

        let vschema = VSchema::builder()
            .sharded_keyspace("app", &TWO)
            .vindex("app", "uhash", VindexDef::hash())
            .vindex(
                "app",
                "by_email",
                VindexDef::lookup("global.users_by_email", "email", "keyspace_id", true),
            )
            .table("app", "users", &[("id", "uhash"), ("email", "by_email")])
            .unsharded_keyspace("global")
            .build();

        let mut tablets: Vec<Tablet> = TWO
            .iter()
            .zip(&shard_mocks)
            .map(|(shard, mock)| {
                Tablet::new(
                    "app",
                    shard,
                    Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
                )
            })
            .collect();
        tablets.push(Tablet::new(
            "global",
            "-",
            Arc::new(PostgresEngine::new(Box::new(lookup_mock.clone()))),
        ));

        let gateway = Gateway::new(
            vschema,
            tablets,
            GatewayOptions {
                twopc_log: dir.path().join("2pc.log"),
                ..Default::default()
            },
        )
        .unwrap();

        let sql = "SELECT * FROM users WHERE email = 'ann@example.com'";
        assert_eq!(gateway.plan(sql, &[]).unwrap().kind, PlanKind::Lookup);

        gateway.query(sql, &[]).await.unwrap();

        // The lookup table answered, then only "-80" saw the select.
        assert!(lookup_mock
            .sql_log()
            .iter()
            .any(|sql| sql.contains("users_by_email")));
        assert!(shard_mocks[0]
            .sql_log()
            .iter()
            .any(|sql| sql.contains("FROM users")));
        assert!(shard_mocks[1].sql_log().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_two_shards_runs_2pc() {
        let dir = tempfile::tempdir().unwrap();
        let shard_mocks = mocks(2);
        let gateway = build_gateway(&TWO, &shard_mocks, &dir);

        // Find ids on different shards.
        let a = 1_i64;
        let b = (2..200)
            .find(|id| shard_of(*id, &TWO) != shard_of(a, &TWO))
            .unwrap();

        gateway
            .transaction(TransactionOptions::default(), |session| async move {
                session
                    .execute(
                        "INSERT INTO users (id, name) VALUES ($1, 'a')",
                        &[Datum::Bigint(a)],
                    )
                    .await?;
                session
                    .execute(
                        "INSERT INTO users (id, name) VALUES ($1, 'b')",
                        &[Datum::Bigint(b)],
                    )
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        for mock in &shard_mocks {
            let prepares = mock
                .sql_log()
                .iter()
                .filter(|sql| sql.starts_with("PREPARE TRANSACTION"))
                .count();
            let commits = mock
                .sql_log()
                .iter()
                .filter(|sql| sql.starts_with("COMMIT PREPARED"))
                .count();
            assert_eq!(prepares, 1);
            assert_eq!(commits, 1);
        }
    }

    #[tokio::test]
    async fn test_transaction_single_shard_commits_directly() {
        let dir = tempfile::tempdir().unwrap();
        let shard_mocks = mocks(2);
        let gateway = build_gateway(&TWO, &shard_mocks, &dir);

        gateway
            .transaction(TransactionOptions::default(), |session| async move {
                session
                    .execute(
                        "INSERT INTO users (id, name) VALUES (7, 'a')",
                        &[],
                    )
                    .await?;
                session
                    .query("SELECT * FROM users WHERE id = 7", &[])
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        let total_commits: usize = shard_mocks.iter().map(|mock| mock.commits()).sum();
        assert_eq!(total_commits, 1);
        for mock in &shard_mocks {
            assert!(!mock
                .sql_log()
                .iter()
                .any(|sql| sql.starts_with("PREPARE TRANSACTION")));
        }
    }

    #[tokio::test]
    async fn test_transaction_body_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let shard_mocks = mocks(2);
        let gateway = build_gateway(&TWO, &shard_mocks, &dir);

        let result: Result<(), Error> = gateway
            .transaction(TransactionOptions::default(), |session| async move {
                session
                    .execute("INSERT INTO users (id, name) VALUES (7, 'a')", &[])
                    .await?;
                Err(Error::Unsupported("application gave up".into()))
            })
            .await;
        assert!(result.is_err());

        let rollbacks: usize = shard_mocks.iter().map(|mock| mock.rollbacks()).sum();
        assert_eq!(rollbacks, 1);
        let commits: usize = shard_mocks.iter().map(|mock| mock.commits()).sum();
        assert_eq!(commits, 0);
    }

    #[tokio::test]
    async fn test_auto_increment_fills_from_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let seq_mock = MockBackend::new().with_rows(
            "SELECT next_id FROM order_seq",
            QueryResult::new(
                vec![Field::bigint("next_id")],
                vec![row(&[("next_id", Datum::Bigint(100))])],
            ),
        );
        let shard_mocks = mocks(2);

        let vschema = VSchema::builder()
            .sharded_keyspace("app", &TWO)
            .vindex("app", "uhash", VindexDef::hash())
            .table("app", "orders", &[("user_id", "uhash")])
            .unsharded_keyspace("global")
            .sequence("global", "order_seq")
            .auto_increment("app", "orders", "id", "order_seq")
            .build();

        let mut tablets: Vec<Tablet> = TWO
            .iter()
            .zip(&shard_mocks)
            .map(|(shard, mock)| {
                Tablet::new(
                    "app",
                    shard,
                    Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
                )
            })
            .collect();
        tablets.push(Tablet::new(
            "global",
            "-",
            Arc::new(PostgresEngine::new(Box::new(seq_mock.clone()))),
        ));

        let gateway = Gateway::new(
            vschema,
            tablets,
            GatewayOptions {
                twopc_log: dir.path().join("2pc.log"),
                ..Default::default()
            },
        )
        .unwrap();

        gateway
            .execute(
                "INSERT INTO orders (user_id) VALUES ($1)",
                &[Datum::Bigint(5)],
            )
            .await
            .unwrap();

        // The sequence was reserved and the id injected.
        assert!(seq_mock
            .sql_log()
            .iter()
            .any(|sql| sql.contains("UPDATE order_seq SET next_id = next_id + 1")));
        let insert_params: Vec<Vec<Datum>> = shard_mocks
            .iter()
            .flat_map(|mock| mock.params_log())
            .filter(|params| !params.is_empty())
            .collect();
        assert_eq!(
            insert_params,
            vec![vec![Datum::Bigint(5), Datum::Bigint(100)]]
        );
    }

    #[tokio::test]
    async fn test_auto_increment_can_back_the_sharding_key() {
        let dir = tempfile::tempdir().unwrap();
        let seq_mock = MockBackend::new().with_rows(
            "SELECT next_id FROM account_seq",
            QueryResult::new(
                vec![Field::bigint("next_id")],
                vec![row(&[("next_id", Datum::Bigint(500))])],
            ),
        );
        let shard_mocks = mocks(2);

        let vschema = VSchema::builder()
            .sharded_keyspace("app", &TWO)
            .vindex("app", "uhash", VindexDef::hash())
            .table("app", "accounts", &[("id", "uhash")])
            .unsharded_keyspace("global")
            .sequence("global", "account_seq")
            .auto_increment("app", "accounts", "id", "account_seq")
            .build();

        let mut tablets: Vec<Tablet> = TWO
            .iter()
            .zip(&shard_mocks)
            .map(|(shard, mock)| {
                Tablet::new(
                    "app",
                    shard,
                    Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
                )
            })
            .collect();
        tablets.push(Tablet::new(
            "global",
            "-",
            Arc::new(PostgresEngine::new(Box::new(seq_mock.clone()))),
        ));

        let gateway = Gateway::new(
            vschema,
            tablets,
            GatewayOptions {
                twopc_log: dir.path().join("2pc.log"),
                ..Default::default()
            },
        )
        .unwrap();

        // The sharding key itself is absent; the sequence supplies it.
        gateway
            .execute("INSERT INTO accounts (name) VALUES ('ann')", &[])
            .await
            .unwrap();

        let target = shard_of(500, &TWO);
        let index = TWO.iter().position(|shard| *shard == target).unwrap();
        let params = shard_mocks[index].params_log();
        assert_eq!(
            params,
            vec![vec![Datum::Text("ann".into()), Datum::Bigint(500)]]
        );
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        gateway.query("SELECT id FROM users", &[]).await.unwrap();

        let status = gateway.status("app").unwrap();
        assert_eq!(status.shard_count, 2);
        assert_eq!(status.engine, "postgres");
        assert_eq!(status.total_queries, 2);
        assert_eq!(status.total_errors, 0);

        let health = gateway.health();
        assert!(health.healthy);
        assert_eq!(health.shards_total, 2);
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = build_gateway(&TWO, &mocks(2), &dir);

        let batch = gateway
            .batch(&[
                (
                    "INSERT INTO users (id, name) VALUES (1, 'a')".into(),
                    vec![],
                ),
                ("SELECT * FROM users WHERE id = 1".into(), vec![]),
                ("SELECT * FROM missing_table".into(), vec![]),
                ("SELECT * FROM users WHERE id = 2".into(), vec![]),
            ])
            .await;

        assert!(!batch.success);
        assert_eq!(batch.failed_at, Some(2));
        assert_eq!(batch.results.len(), 2);
        assert!(batch.error.unwrap().contains("missing_table"));
    }

    #[tokio::test]
    async fn test_unsharded_keyspace_single_pseudo_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBackend::new();
        let vschema = VSchema::builder().unsharded_keyspace("tiny").build();
        let gateway = Gateway::new(
            vschema,
            vec![Tablet::new(
                "tiny",
                "-",
                Arc::new(PostgresEngine::new(Box::new(mock.clone()))),
            )],
            GatewayOptions {
                twopc_log: dir.path().join("2pc.log"),
                ..Default::default()
            },
        )
        .unwrap();

        let route = gateway.route("SELECT * FROM anything", &[]).unwrap();
        assert_eq!(route.shards, vec!["-"]);
        assert!(!route.is_scatter);

        gateway.query("SELECT * FROM anything", &[]).await.unwrap();
        assert_eq!(mock.sql_log().len(), 1);
    }
}
