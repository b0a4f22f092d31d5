//! Per-shard statement rewrites for scatter plans.
//!
//! Cross-shard aggregates decompose into per-shard partials and a
//! gateway-side merge: COUNT stays COUNT and the partials are summed,
//! AVG becomes per-shard SUM + COUNT, ORDER BY/LIMIT/OFFSET move to the
//! gateway's k-way merge with the per-shard LIMIT widened to
//! `offset + limit`.

use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArgumentList, FunctionArguments, Ident,
    ObjectName, Query, Select, SelectItem, SetExpr, Statement, Value,
};

use super::error::Error;
use super::parser::StatementInfo;
use crate::aggregate::{AggregateFunction, AggregateOp, AggregationContext};

/// A statement rewritten for the shards plus the merge instructions.
#[derive(Debug, Clone)]
pub struct ScatterRewrite {
    pub shard_sql: String,
    pub context: AggregationContext,
}

fn make_func(name: &str, arg: FunctionArg) -> Expr {
    Expr::Function(Function {
        name: ObjectName(vec![Ident::new(name)]),
        uses_odbc_syntax: false,
        parameters: FunctionArguments::None,
        args: FunctionArguments::List(FunctionArgumentList {
            duplicate_treatment: None,
            args: vec![arg],
            clauses: vec![],
        }),
        filter: None,
        null_treatment: None,
        over: None,
        within_group: vec![],
    })
}

fn column_arg(column: &str) -> FunctionArg {
    if column == "*" {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard)
    } else {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Identifier(Ident::new(column))))
    }
}

fn aliased(expr: Expr, alias: &str) -> SelectItem {
    SelectItem::ExprWithAlias {
        expr,
        alias: Ident::new(alias),
    }
}

fn number(value: usize) -> Expr {
    Expr::Value(Value::Number(value.to_string(), false))
}

/// Rewrite a SELECT for scatter execution. `None` means the original
/// statement can go to the shards untouched and results simply
/// concatenate.
pub fn rewrite_select(info: &StatementInfo) -> Result<Option<ScatterRewrite>, Error> {
    let Statement::Query(query) = &info.statement else {
        return Ok(None);
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Ok(None);
    };

    if !info.aggregates.is_empty() {
        return rewrite_aggregate(info, query, select).map(Some);
    }

    let needs_merge = !info.order_by.is_empty()
        || info.limit.is_some()
        || info.offset.is_some()
        || info.distinct
        || !info.group_by.is_empty();
    if !needs_merge {
        return Ok(None);
    }

    // Plain scatter with ORDER BY/LIMIT: shards pre-sort, the gateway
    // merges. The per-shard limit widens to offset + limit; OFFSET never
    // goes to a shard.
    let mut shard_query = (**query).clone();
    shard_query.offset = None;
    shard_query.limit = info
        .limit
        .map(|limit| number(info.offset.unwrap_or(0) + limit));

    Ok(Some(ScatterRewrite {
        shard_sql: Statement::Query(Box::new(shard_query)).to_string(),
        context: AggregationContext {
            aggregates: vec![],
            group_by: vec![],
            order_by: info.order_by.clone(),
            limit: info.limit,
            offset: info.offset,
            distinct: info.distinct || !info.group_by.is_empty(),
        },
    }))
}

fn rewrite_aggregate(
    info: &StatementInfo,
    query: &Query,
    select: &Select,
) -> Result<ScatterRewrite, Error> {
    let distinct_count = info.aggregates.iter().any(|aggregate| aggregate.distinct);
    if distinct_count {
        if info.aggregates.len() > 1 || !info.group_by.is_empty() {
            return Err(Error::Unsupported(
                "COUNT(DISTINCT) cannot combine with other aggregates or GROUP BY".into(),
            ));
        }
        return rewrite_count_distinct(info, query, select);
    }

    let mut projection: Vec<SelectItem> = vec![];
    let mut ops: Vec<AggregateOp> = vec![];
    let mut parsed = info.aggregates.iter();
    let mut helper = 0usize;

    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => Some(expr),
            _ => None,
        };
        let is_aggregate = matches!(
            expr,
            Some(Expr::Function(function)) if matches!(
                function.name.to_string().to_lowercase().as_str(),
                "count" | "sum" | "avg" | "min" | "max"
            )
        );
        let aggregate = if is_aggregate { parsed.next() } else { None };

        let Some(aggregate) = aggregate else {
            projection.push(item.clone());
            continue;
        };

        match aggregate.function {
            AggregateFunction::Avg => {
                helper += 1;
                let sum_alias = format!("__sg_sum_{}", helper);
                let count_alias = format!("__sg_count_{}", helper);
                projection.push(aliased(
                    make_func("SUM", column_arg(&aggregate.column)),
                    &sum_alias,
                ));
                projection.push(aliased(
                    make_func("COUNT", column_arg(&aggregate.column)),
                    &count_alias,
                ));
                ops.push(AggregateOp::avg(&aggregate.alias, &sum_alias, &count_alias));
            }
            function => {
                let name = match function {
                    AggregateFunction::Count => "COUNT",
                    AggregateFunction::Sum => "SUM",
                    AggregateFunction::Min => "MIN",
                    AggregateFunction::Max => "MAX",
                    AggregateFunction::Avg => unreachable!("handled above"),
                };
                projection.push(aliased(
                    make_func(name, column_arg(&aggregate.column)),
                    &aggregate.alias,
                ));
                ops.push(AggregateOp::new(
                    function,
                    &aggregate.alias,
                    &aggregate.alias,
                ));
            }
        }
    }

    let mut shard_select = select.clone();
    shard_select.projection = projection;

    let mut shard_query = query.clone();
    shard_query.body = Box::new(SetExpr::Select(Box::new(shard_select)));
    // The gateway re-aggregates, sorts and limits.
    shard_query.order_by = None;
    shard_query.limit = None;
    shard_query.offset = None;

    Ok(ScatterRewrite {
        shard_sql: Statement::Query(Box::new(shard_query)).to_string(),
        context: AggregationContext {
            aggregates: ops,
            group_by: info.group_by.clone(),
            order_by: info.order_by.clone(),
            limit: info.limit,
            offset: info.offset,
            distinct: false,
        },
    })
}

/// `COUNT(DISTINCT col)`: shards return their local DISTINCT values and
/// the gateway counts the union.
fn rewrite_count_distinct(
    info: &StatementInfo,
    query: &Query,
    select: &Select,
) -> Result<ScatterRewrite, Error> {
    let aggregate = &info.aggregates[0];
    if aggregate.column == "*" {
        return Err(Error::Unsupported("COUNT(DISTINCT *)".into()));
    }

    let mut shard_select = select.clone();
    shard_select.distinct = Some(sqlparser::ast::Distinct::Distinct);
    shard_select.projection = vec![aliased(
        Expr::Identifier(Ident::new(aggregate.column.as_str())),
        &aggregate.alias,
    )];

    let mut shard_query = query.clone();
    shard_query.body = Box::new(SetExpr::Select(Box::new(shard_select)));
    shard_query.order_by = None;
    shard_query.limit = None;
    shard_query.offset = None;

    let mut op = AggregateOp::new(
        AggregateFunction::Count,
        &aggregate.alias,
        &aggregate.alias,
    );
    op.distinct = true;

    Ok(ScatterRewrite {
        shard_sql: Statement::Query(Box::new(shard_query)).to_string(),
        context: AggregationContext {
            aggregates: vec![op],
            group_by: vec![],
            order_by: vec![],
            limit: info.limit,
            offset: info.offset,
            distinct: false,
        },
    })
}

#[cfg(test)]
mod test {
    use super::super::parser::analyze;
    use super::*;

    fn rewrite(sql: &str) -> ScatterRewrite {
        rewrite_select(&analyze(sql).unwrap()).unwrap().unwrap()
    }

    #[test]
    fn test_plain_select_passes_through() {
        let info = analyze("SELECT * FROM users WHERE active = TRUE").unwrap();
        assert!(rewrite_select(&info).unwrap().is_none());
    }

    #[test]
    fn test_count_keeps_alias() {
        let rewritten = rewrite("SELECT COUNT(*) AS count FROM events");
        assert_eq!(rewritten.shard_sql, "SELECT COUNT(*) AS count FROM events");
        assert_eq!(rewritten.context.aggregates.len(), 1);
        assert_eq!(rewritten.context.aggregates[0].alias, "count");
    }

    #[test]
    fn test_avg_decomposes_to_sum_and_count() {
        let rewritten = rewrite("SELECT AVG(value) AS avg FROM events");
        assert_eq!(
            rewritten.shard_sql,
            "SELECT SUM(value) AS __sg_sum_1, COUNT(value) AS __sg_count_1 FROM events"
        );
        let op = &rewritten.context.aggregates[0];
        assert_eq!(op.alias, "avg");
        assert_eq!(op.sum_column.as_deref(), Some("__sg_sum_1"));
        assert_eq!(op.count_column.as_deref(), Some("__sg_count_1"));
    }

    #[test]
    fn test_group_by_passes_to_shards() {
        let rewritten =
            rewrite("SELECT region, SUM(price) AS total FROM orders GROUP BY region");
        assert_eq!(
            rewritten.shard_sql,
            "SELECT region, SUM(price) AS total FROM orders GROUP BY region"
        );
        assert_eq!(rewritten.context.group_by, vec!["region"]);
    }

    #[test]
    fn test_aggregate_strips_order_and_limit_from_shards() {
        let rewritten = rewrite(
            "SELECT region, COUNT(*) AS count FROM orders \
             GROUP BY region ORDER BY count DESC LIMIT 3",
        );
        assert!(!rewritten.shard_sql.to_uppercase().contains("ORDER BY"));
        assert!(!rewritten.shard_sql.to_uppercase().contains("LIMIT"));
        assert_eq!(rewritten.context.limit, Some(3));
        assert!(rewritten.context.order_by[0].descending);
    }

    #[test]
    fn test_sorted_scatter_widens_limit() {
        let rewritten =
            rewrite("SELECT id FROM events ORDER BY id LIMIT 10 OFFSET 5");
        assert!(rewritten.shard_sql.contains("ORDER BY id"));
        assert!(rewritten.shard_sql.contains("LIMIT 15"));
        assert!(!rewritten.shard_sql.to_uppercase().contains("OFFSET"));
        assert_eq!(rewritten.context.limit, Some(10));
        assert_eq!(rewritten.context.offset, Some(5));
    }

    #[test]
    fn test_count_distinct_fetches_shard_values() {
        let rewritten = rewrite("SELECT COUNT(DISTINCT city) AS cities FROM users");
        assert_eq!(
            rewritten.shard_sql,
            "SELECT DISTINCT city AS cities FROM users"
        );
        assert!(rewritten.context.aggregates[0].distinct);
    }

    #[test]
    fn test_count_distinct_with_group_by_unsupported() {
        let info =
            analyze("SELECT region, COUNT(DISTINCT city) FROM users GROUP BY region").unwrap();
        assert!(matches!(
            rewrite_select(&info),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_where_clause_stays_on_shards() {
        let rewritten =
            rewrite("SELECT COUNT(*) AS count FROM events WHERE kind = 'click'");
        assert!(rewritten.shard_sql.contains("WHERE kind = 'click'"));
    }
}
