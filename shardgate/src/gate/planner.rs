//! Routing rules.
//!
//! Applied in order: resolve the table, take the unsharded shortcut,
//! then try point equality, IN, range and lookup predicates on the
//! table's primary vindex, co-located joins, and finally fall back to a
//! scatter. Aggregates and sorted/limited scatters pick up a merge
//! context from the rewrite step.

use shardgate_config::{Keyspace, TableKind, VSchema, VindexDef};

use super::error::Error;
use super::parser::{Predicate, StatementInfo, StatementKind};
use super::rewrite::rewrite_select;
use super::route::{LookupStep, PlanKind, QueryPlan, ShardStatement};
use crate::net::Datum;
use crate::sharding::{route_to_shard, HashRing, Vindex, DEFAULT_VNODES};

pub fn plan(
    vschema: &VSchema,
    sql: &str,
    info: &StatementInfo,
    params: &[Datum],
) -> Result<QueryPlan, Error> {
    let (ks_name, keyspace, table_name) = resolve_table(vschema, info)?;
    let shards = keyspace.shard_names();

    let base = QueryPlan {
        kind: PlanKind::Scatter,
        keyspace: ks_name.to_string(),
        sql: sql.to_string(),
        params: params.to_vec(),
        shards: shards.clone(),
        write: info.kind.is_write(),
        aggregation: None,
        lookup: None,
        per_shard: None,
    };

    // Unsharded keyspace: everything goes to the one "-" shard.
    if !keyspace.sharded {
        return Ok(QueryPlan {
            kind: PlanKind::Unsharded,
            shards: vec!["-".into()],
            ..base
        });
    }

    let table = table_name
        .as_deref()
        .and_then(|name| keyspace.tables.get(name));

    // Reference tables exist on every shard: reads pin to the first
    // shard, writes fan out to keep the copies identical.
    if let Some(table) = table {
        if table.kind == TableKind::Reference {
            return Ok(if info.kind.is_write() {
                base
            } else {
                QueryPlan {
                    kind: PlanKind::SingleShard,
                    shards: vec![shards[0].clone()],
                    ..base
                }
            });
        }
        if table.kind == TableKind::Sequence {
            return Ok(QueryPlan {
                kind: PlanKind::SingleShard,
                shards: vec![shards[0].clone()],
                ..base
            });
        }
    }

    let Some(table) = table else {
        return Err(Error::TableNotFound(
            table_name.unwrap_or_else(|| "?".into()),
        ));
    };
    let table_display = table_name.clone().unwrap_or_default();

    let column_vindex = table.primary_vindex().ok_or_else(|| Error::UnknownVindex {
        table: table_display.clone(),
        vindex: "<none>".into(),
    })?;
    let vindex_name = column_vindex.name.clone();
    let vindex_def = keyspace
        .vindexes
        .get(&vindex_name)
        .ok_or_else(|| Error::UnknownVindex {
            table: table_display.clone(),
            vindex: vindex_name.clone(),
        })?;
    let vindex = Vindex::from_def(vindex_def)?;
    let vindex_column = column_vindex.first_column().unwrap_or_default().to_string();

    if info.kind == StatementKind::Insert {
        return plan_insert(info, params, &vindex, &vindex_column, &table_display, base);
    }

    // Point equality on the primary vindex column.
    if let Some(value) = predicate_eq(&info.predicates, &vindex_column, params)? {
        if vindex.needs_lookup() {
            return plan_lookup(vschema, vindex_def, &vindex_name, value, base);
        }
        let shard = shard_for_value(&vindex, vindex_def, &value, keyspace)?;
        return finalize_read(
            info,
            QueryPlan {
                kind: PlanKind::SingleShard,
                shards: vec![shard],
                ..base
            },
        );
    }

    // IN on the primary vindex column.
    if let Some(values) = predicate_in(&info.predicates, &vindex_column, params)? {
        let mut targets: Vec<String> = vec![];
        for value in values {
            let shard = shard_for_value(&vindex, vindex_def, &value, keyspace)?;
            if !targets.contains(&shard) {
                targets.push(shard);
            }
        }
        let scatter = targets.len() == shards.len();
        let plan = QueryPlan {
            kind: if scatter {
                PlanKind::Scatter
            } else {
                PlanKind::MultiShard
            },
            shards: if scatter { shards.clone() } else { targets },
            ..base
        };
        return finalize_read(info, plan);
    }

    // Range predicate on a range-vindexed column.
    if let Vindex::Range(range_vindex) = &vindex {
        if let Some((low, high)) = predicate_range(&info.predicates, &vindex_column, params)? {
            let targets: Vec<String> = range_vindex
                .shards_for_range(low, high)
                .into_iter()
                .map(str::to_string)
                .collect();
            if !targets.is_empty() {
                let scatter = targets.len() == shards.len();
                let plan = QueryPlan {
                    kind: if scatter {
                        PlanKind::Scatter
                    } else {
                        PlanKind::MultiShard
                    },
                    shards: targets,
                    ..base
                };
                return finalize_read(info, plan);
            }
        }
    }

    // Point equality on a secondary column vindex. Lookup vindexes defer
    // to the lookup table; unique functional ones route directly.
    for column_vindex in table.column_vindexes.iter().skip(1) {
        let Some(column) = column_vindex.first_column() else {
            continue;
        };
        let Some(value) = predicate_eq(&info.predicates, column, params)? else {
            continue;
        };
        let Some(secondary_def) = keyspace.vindexes.get(&column_vindex.name) else {
            continue;
        };
        let secondary = Vindex::from_def(secondary_def)?;
        if secondary.needs_lookup() {
            return plan_lookup(vschema, secondary_def, &column_vindex.name, value, base);
        }
        if secondary.unique() {
            let shard = shard_for_value(&secondary, secondary_def, &value, keyspace)?;
            return finalize_read(
                info,
                QueryPlan {
                    kind: PlanKind::SingleShard,
                    shards: vec![shard],
                    ..base
                },
            );
        }
    }

    // Co-located join: both tables share the primary vindex, the join
    // equates the vindexed columns, and one side is bound to a value.
    if let Some(join) = &info.join {
        let co_located = co_located_join(keyspace, join);
        if let Some(join_column) = co_located {
            let bound = predicate_eq(&info.predicates, &join.left_column, params)?
                .or(predicate_eq(&info.predicates, &join.right_column, params)?)
                .or(predicate_eq(&info.predicates, &join_column, params)?);
            if let Some(value) = bound {
                if !vindex.needs_lookup() {
                    let shard = shard_for_value(&vindex, vindex_def, &value, keyspace)?;
                    return finalize_read(
                        info,
                        QueryPlan {
                            kind: PlanKind::SingleShard,
                            shards: vec![shard],
                            ..base
                        },
                    );
                }
            }
        }
    }

    // Nothing narrowed the route: scatter.
    finalize_read(info, base)
}

/// Attach merge instructions to cross-shard reads; single-shard plans
/// pass through untouched.
fn finalize_read(info: &StatementInfo, plan: QueryPlan) -> Result<QueryPlan, Error> {
    if info.kind != StatementKind::Select || plan.shards.len() <= 1 {
        return Ok(plan);
    }
    let Some(rewritten) = rewrite_select(info)? else {
        return Ok(plan);
    };
    let aggregating = rewritten.context.is_aggregating();
    Ok(QueryPlan {
        kind: if aggregating {
            PlanKind::ScatterAggregate
        } else {
            plan.kind
        },
        sql: rewritten.shard_sql,
        aggregation: Some(rewritten.context),
        ..plan
    })
}

fn resolve_table<'a>(
    vschema: &'a VSchema,
    info: &StatementInfo,
) -> Result<(&'a str, &'a Keyspace, Option<String>), Error> {
    if let Some(ks_name) = &info.keyspace {
        let keyspace = vschema
            .keyspace(ks_name)
            .ok_or_else(|| Error::KeyspaceNotFound(ks_name.clone()))?;
        let name = vschema
            .keyspaces
            .get_key_value(ks_name)
            .map(|(name, _)| name.as_str())
            .unwrap_or_default();
        return Ok((name, keyspace, info.table.clone()));
    }

    let Some(table) = &info.table else {
        return Err(Error::Unsupported("statement without a target table".into()));
    };

    if let Some((ks_name, keyspace, _)) = vschema.find_table(table) {
        return Ok((ks_name, keyspace, Some(table.clone())));
    }

    // A lone unsharded keyspace accepts tables it has not declared.
    if vschema.keyspaces.len() == 1 {
        if let Some((name, keyspace)) = vschema.keyspaces.iter().find(|(_, ks)| !ks.sharded) {
            return Ok((name.as_str(), keyspace, Some(table.clone())));
        }
    }

    Err(Error::TableNotFound(table.clone()))
}

fn predicate_eq(
    predicates: &[Predicate],
    column: &str,
    params: &[Datum],
) -> Result<Option<Datum>, Error> {
    for predicate in predicates {
        if let Predicate::Eq { column: found, value } = predicate {
            if found == column {
                return Ok(Some(value.resolve(params)?));
            }
        }
    }
    Ok(None)
}

fn predicate_in(
    predicates: &[Predicate],
    column: &str,
    params: &[Datum],
) -> Result<Option<Vec<Datum>>, Error> {
    for predicate in predicates {
        if let Predicate::In { column: found, values } = predicate {
            if found == column {
                let resolved: Result<Vec<_>, _> =
                    values.iter().map(|value| value.resolve(params)).collect();
                return Ok(Some(resolved?));
            }
        }
    }
    Ok(None)
}

/// Merge >=/<=/BETWEEN bounds on one column into a single interval.
fn predicate_range(
    predicates: &[Predicate],
    column: &str,
    params: &[Datum],
) -> Result<Option<(Option<i64>, Option<i64>)>, Error> {
    let mut low: Option<i64> = None;
    let mut high: Option<i64> = None;
    let mut found = false;

    for predicate in predicates {
        if let Predicate::Range {
            column: name,
            low: predicate_low,
            high: predicate_high,
        } = predicate
        {
            if name != column {
                continue;
            }
            found = true;
            if let Some(value) = predicate_low {
                if let Some(int) = value.resolve(params)?.as_i64() {
                    low = Some(low.map_or(int, |current: i64| current.max(int)));
                }
            }
            if let Some(value) = predicate_high {
                if let Some(int) = value.resolve(params)?.as_i64() {
                    high = Some(high.map_or(int, |current: i64| current.min(int)));
                }
            }
        }
    }

    Ok(found.then_some((low, high)))
}

fn shard_for_value(
    vindex: &Vindex,
    def: &VindexDef,
    value: &Datum,
    keyspace: &Keyspace,
) -> Result<String, Error> {
    let shards = keyspace.shard_names();

    if let Vindex::Range(range_vindex) = vindex {
        let shard = range_vindex
            .find_shard(value)?
            .ok_or(crate::sharding::Error::NoShardForKey(0))?;
        return Ok(shard.to_string());
    }

    let keyspace_id = crate::sharding::compute_keyspace_id(vindex, value)?;

    if let Vindex::ConsistentHash { .. } = vindex {
        let ring = HashRing::new(&shards, def.vnodes.unwrap_or(DEFAULT_VNODES))?;
        return Ok(ring.shard_for(keyspace_id).to_string());
    }

    let ranges = keyspace.key_ranges()?;
    let index = route_to_shard(keyspace_id, &ranges)?;
    Ok(shards[index].clone())
}

fn plan_lookup(
    vschema: &VSchema,
    def: &VindexDef,
    vindex_name: &str,
    value: Datum,
    base: QueryPlan,
) -> Result<QueryPlan, Error> {
    // The lookup table lives in its own keyspace, "ks.table" or found by
    // name.
    let lookup_table = def.lookup_table.as_deref().unwrap_or_default();
    let lookup_keyspace = match lookup_table.split_once('.') {
        Some((keyspace, _)) => keyspace.to_string(),
        None => vschema
            .find_table(lookup_table)
            .map(|(keyspace, _, _)| keyspace.to_string())
            .unwrap_or_else(|| base.keyspace.clone()),
    };

    Ok(QueryPlan {
        kind: PlanKind::Lookup,
        lookup: Some(LookupStep {
            keyspace: lookup_keyspace,
            vindex: vindex_name.to_string(),
            value,
        }),
        ..base
    })
}

fn plan_insert(
    info: &StatementInfo,
    params: &[Datum],
    vindex: &Vindex,
    vindex_column: &str,
    table: &str,
    base: QueryPlan,
) -> Result<QueryPlan, Error> {
    let insert = info.insert.as_ref().ok_or_else(|| {
        Error::Parse("insert without a VALUES list".into())
    })?;

    if vindex.needs_lookup() {
        return Err(Error::Unsupported(
            "insert routed through a lookup vindex".into(),
        ));
    }

    let key_index = insert
        .columns
        .iter()
        .position(|column| column == vindex_column)
        .ok_or_else(|| Error::ShardingKeyRequired {
            table: table.to_string(),
            column: vindex_column.to_string(),
        })?;

    // Rows grouped by target shard, each group a self-contained insert.
    let keyspace = KeyspaceView {
        shards: base.shards.clone(),
    };
    let mut groups: Vec<(String, Vec<Vec<Datum>>)> = vec![];
    for row in &insert.rows {
        let value = row
            .get(key_index)
            .ok_or_else(|| Error::ShardingKeyRequired {
                table: table.to_string(),
                column: vindex_column.to_string(),
            })?
            .resolve(params)?;
        let resolved: Result<Vec<Datum>, Error> =
            row.iter().map(|value| value.resolve(params)).collect();
        let shard = keyspace.shard_for(vindex, &value)?;

        match groups.iter_mut().find(|(name, _)| *name == shard) {
            Some((_, rows)) => rows.push(resolved?),
            None => groups.push((shard, vec![resolved?])),
        }
    }

    if groups.len() == 1 {
        let (shard, rows) = groups.remove(0);
        let (sql, bound) = build_insert(table, &insert.columns, &rows);
        return Ok(QueryPlan {
            kind: PlanKind::SingleShard,
            shards: vec![shard],
            sql,
            params: bound,
            ..base
        });
    }

    let statements = groups
        .into_iter()
        .map(|(shard, rows)| {
            let (sql, bound) = build_insert(table, &insert.columns, &rows);
            ShardStatement {
                shard,
                sql,
                params: bound,
            }
        })
        .collect::<Vec<_>>();

    Ok(QueryPlan {
        kind: PlanKind::MultiShard,
        shards: statements.iter().map(|s| s.shard.clone()).collect(),
        per_shard: Some(statements),
        ..base
    })
}

/// Shard resolution against a plain shard list; inserts never use the
/// consistent-hash ring or ranges differently from reads, so this only
/// needs the default range mapping.
struct KeyspaceView {
    shards: Vec<String>,
}

impl KeyspaceView {
    fn shard_for(&self, vindex: &Vindex, value: &Datum) -> Result<String, Error> {
        if let Vindex::Range(range_vindex) = vindex {
            let shard = range_vindex
                .find_shard(value)?
                .ok_or(crate::sharding::Error::NoShardForKey(0))?;
            return Ok(shard.to_string());
        }
        let keyspace_id = crate::sharding::compute_keyspace_id(vindex, value)?;
        let ranges: Result<Vec<_>, _> = self.shards.iter().map(|name| name.parse()).collect();
        let ranges = ranges.map_err(shardgate_config::Error::from)?;
        let index = route_to_shard(keyspace_id, &ranges)?;
        Ok(self.shards[index].clone())
    }
}

fn build_insert(table: &str, columns: &[String], rows: &[Vec<Datum>]) -> (String, Vec<Datum>) {
    let mut params = vec![];
    let mut tuples = vec![];
    for row in rows {
        let mut placeholders = vec![];
        for value in row {
            params.push(value.clone());
            placeholders.push(format!("${}", params.len()));
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        tuples.join(", ")
    );
    (sql, params)
}

fn co_located_join(keyspace: &Keyspace, join: &super::parser::JoinInfo) -> Option<String> {
    let left = keyspace.tables.get(&join.left_table)?;
    let right = keyspace.tables.get(&join.right_table)?;
    let left_vindex = left.primary_vindex()?;
    let right_vindex = right.primary_vindex()?;
    if left_vindex.name != right_vindex.name {
        return None;
    }

    let left_column = left_vindex.first_column()?;
    let right_column = right_vindex.first_column()?;
    let equates = (join.left_column == left_column && join.right_column == right_column)
        || (join.left_column == right_column && join.right_column == left_column);
    equates.then(|| left_column.to_string())
}
