//! Minimal statement analysis.
//!
//! The router does not plan general SQL; it extracts exactly what routing
//! and result merging need: the target table, point/IN/range predicates
//! on sharding columns, INSERT rows, join equalities, aggregates, GROUP
//! BY, ORDER BY and LIMIT/OFFSET. Everything else passes through to the
//! shards untouched.

use sqlparser::ast::{
    BinaryOperator, Delete, Distinct, DuplicateTreatment, Expr, FromTable, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, Insert, JoinConstraint, JoinOperator,
    ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::error::Error;
use crate::aggregate::{AggregateFunction, SortSpec};
use crate::net::Datum;

/// A literal or placeholder the planner can resolve against the bound
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerValue {
    Literal(Datum),
    /// 1-based parameter index.
    Placeholder(usize),
}

impl PlannerValue {
    /// Resolve to a concrete value. Placeholder misses were already
    /// rejected by the placeholder scanner at the adapter boundary, but
    /// the planner resolves eagerly and reports them first.
    pub fn resolve(&self, params: &[Datum]) -> Result<Datum, Error> {
        match self {
            PlannerValue::Literal(datum) => Ok(datum.clone()),
            PlannerValue::Placeholder(index) => params
                .get(index - 1)
                .cloned()
                .ok_or_else(|| {
                    Error::Tablet(crate::tablet::Error::Engine(
                        crate::engine::Error::MissingParam(*index),
                    ))
                }),
        }
    }
}

/// WHERE-clause shapes the router understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq {
        column: String,
        value: PlannerValue,
    },
    In {
        column: String,
        values: Vec<PlannerValue>,
    },
    /// BETWEEN or a >=/<= pair; open bounds are `None`.
    Range {
        column: String,
        low: Option<PlannerValue>,
        high: Option<PlannerValue>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAggregate {
    pub function: AggregateFunction,
    /// Column inside the call, `*` for COUNT(*).
    pub column: String,
    pub alias: String,
    pub distinct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertInfo {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<PlannerValue>>,
}

/// A two-table inner join with an equality constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinInfo {
    pub left_table: String,
    pub right_table: String,
    pub left_column: String,
    pub right_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

/// Everything the planner needs from one statement.
#[derive(Debug, Clone)]
pub struct StatementInfo {
    pub kind: StatementKind,
    /// Explicit `keyspace.table` qualifier, when present.
    pub keyspace: Option<String>,
    pub table: Option<String>,
    pub predicates: Vec<Predicate>,
    pub insert: Option<InsertInfo>,
    pub join: Option<JoinInfo>,
    pub aggregates: Vec<ParsedAggregate>,
    pub group_by: Vec<String>,
    pub order_by: Vec<SortSpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    /// Retained for per-shard rewrites.
    pub statement: Statement,
}

/// Parse and analyze a single statement.
pub fn analyze(sql: &str) -> Result<StatementInfo, Error> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|err| Error::Parse(err.to_string()))?;
    if statements.len() != 1 {
        return Err(Error::Parse(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    let statement = statements.remove(0);

    match &statement {
        Statement::Query(query) => analyze_query(query, statement.clone()),
        Statement::Insert(insert) => analyze_insert(insert, statement.clone()),
        Statement::Update {
            table, selection, ..
        } => {
            let (keyspace, table) = table_name(&table.relation);
            Ok(StatementInfo {
                kind: StatementKind::Update,
                keyspace,
                table,
                predicates: selection
                    .as_ref()
                    .map(extract_predicates)
                    .unwrap_or_default(),
                ..empty_info(statement.clone())
            })
        }
        Statement::Delete(Delete {
            from, selection, ..
        }) => {
            let tables = match from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            let (keyspace, table) = tables
                .first()
                .map(|table| table_name(&table.relation))
                .unwrap_or((None, None));
            Ok(StatementInfo {
                kind: StatementKind::Delete,
                keyspace,
                table,
                predicates: selection
                    .as_ref()
                    .map(extract_predicates)
                    .unwrap_or_default(),
                ..empty_info(statement.clone())
            })
        }
        Statement::Truncate { .. } => Err(Error::Unsupported("TRUNCATE".into())),
        Statement::SetVariable { .. } => {
            Err(Error::Unsupported("session-level settings".into()))
        }
        other => Ok(StatementInfo {
            kind: StatementKind::Other,
            ..empty_info(other.clone())
        }),
    }
}

fn empty_info(statement: Statement) -> StatementInfo {
    StatementInfo {
        kind: StatementKind::Other,
        keyspace: None,
        table: None,
        predicates: vec![],
        insert: None,
        join: None,
        aggregates: vec![],
        group_by: vec![],
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: false,
        statement,
    }
}

fn analyze_query(query: &Query, statement: Statement) -> Result<StatementInfo, Error> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return Ok(empty_info(statement)),
    };

    let (keyspace, table) = select
        .from
        .first()
        .map(|from| table_name(&from.relation))
        .unwrap_or((None, None));

    let mut info = StatementInfo {
        kind: StatementKind::Select,
        keyspace,
        table,
        predicates: select
            .selection
            .as_ref()
            .map(extract_predicates)
            .unwrap_or_default(),
        join: extract_join(select),
        aggregates: extract_aggregates(select),
        group_by: extract_group_by(select),
        order_by: extract_order_by(query),
        limit: extract_count(query.limit.as_ref()),
        offset: query
            .offset
            .as_ref()
            .and_then(|offset| extract_count(Some(&offset.value))),
        distinct: matches!(select.distinct, Some(Distinct::Distinct)),
        ..empty_info(statement)
    };

    // A GROUP BY without aggregate targets reduces to DISTINCT over the
    // grouped columns once every shard has grouped locally.
    if info.aggregates.is_empty() && !info.group_by.is_empty() {
        info.distinct = true;
    }

    Ok(info)
}

fn analyze_insert(insert: &Insert, statement: Statement) -> Result<StatementInfo, Error> {
    let (keyspace, table) = object_name(&insert.table_name);

    let mut rows = vec![];
    if let Some(source) = &insert.source {
        if let SetExpr::Values(values) = source.body.as_ref() {
            for row in &values.rows {
                rows.push(row.iter().map(planner_value).collect::<Result<_, _>>()?);
            }
        }
    }

    Ok(StatementInfo {
        kind: StatementKind::Insert,
        keyspace,
        table,
        insert: Some(InsertInfo {
            columns: insert.columns.iter().map(|ident| ident.value.clone()).collect(),
            rows,
        }),
        ..empty_info(statement)
    })
}

fn object_name(name: &ObjectName) -> (Option<String>, Option<String>) {
    let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
    match parts.len() {
        0 => (None, None),
        1 => (None, Some(parts[0].clone())),
        _ => (Some(parts[0].clone()), Some(parts[1].clone())),
    }
}

fn table_name(relation: &TableFactor) -> (Option<String>, Option<String>) {
    match relation {
        TableFactor::Table { name, .. } => object_name(name),
        _ => (None, None),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|ident| ident.value.clone()),
        Expr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

fn planner_value(expr: &Expr) -> Result<PlannerValue, Error> {
    match expr {
        Expr::Value(Value::Placeholder(text)) => {
            if let Some(index) = text.strip_prefix('$') {
                let index: usize = index
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad placeholder {}", text)))?;
                Ok(PlannerValue::Placeholder(index))
            } else {
                // Callers normalize `?` to `$n` before analysis; a bare
                // `?` can only appear when analyze() is driven directly.
                Ok(PlannerValue::Placeholder(1))
            }
        }
        Expr::Value(Value::Number(text, _)) => {
            if let Ok(int) = text.parse::<i64>() {
                Ok(PlannerValue::Literal(Datum::Bigint(int)))
            } else {
                text.parse::<f64>()
                    .map(|float| PlannerValue::Literal(Datum::Double(float)))
                    .map_err(|_| Error::Parse(format!("bad number {}", text)))
            }
        }
        Expr::Value(Value::SingleQuotedString(text)) => {
            Ok(PlannerValue::Literal(Datum::Text(text.clone())))
        }
        Expr::Value(Value::Boolean(value)) => {
            Ok(PlannerValue::Literal(Datum::Boolean(*value)))
        }
        Expr::Value(Value::Null) => Ok(PlannerValue::Literal(Datum::Null)),
        Expr::UnaryOp { op, expr }
            if matches!(op, sqlparser::ast::UnaryOperator::Minus) =>
        {
            match planner_value(expr)? {
                PlannerValue::Literal(Datum::Bigint(value)) => {
                    Ok(PlannerValue::Literal(Datum::Bigint(-value)))
                }
                PlannerValue::Literal(Datum::Double(value)) => {
                    Ok(PlannerValue::Literal(Datum::Double(-value)))
                }
                other => Ok(other),
            }
        }
        other => Err(Error::Parse(format!("unsupported value expression {}", other))),
    }
}

/// Collect routable predicates from a WHERE clause. Conjunctions
/// recurse; anything else is ignored (the shard applies it anyway).
fn extract_predicates(expr: &Expr) -> Vec<Predicate> {
    let mut predicates = vec![];
    collect_predicates(expr, &mut predicates);
    predicates
}

fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                collect_predicates(left, out);
                collect_predicates(right, out);
            }
            BinaryOperator::Eq => {
                if let (Some(column), Ok(value)) = (column_name(left), planner_value(right)) {
                    out.push(Predicate::Eq { column, value });
                } else if let (Some(column), Ok(value)) =
                    (column_name(right), planner_value(left))
                {
                    out.push(Predicate::Eq { column, value });
                }
            }
            BinaryOperator::GtEq | BinaryOperator::Gt => {
                if let (Some(column), Ok(value)) = (column_name(left), planner_value(right)) {
                    out.push(Predicate::Range {
                        column,
                        low: Some(value),
                        high: None,
                    });
                }
            }
            BinaryOperator::LtEq | BinaryOperator::Lt => {
                if let (Some(column), Ok(value)) = (column_name(left), planner_value(right)) {
                    out.push(Predicate::Range {
                        column,
                        low: None,
                        high: Some(value),
                    });
                }
            }
            _ => {}
        },
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            if let Some(column) = column_name(expr) {
                let values: Result<Vec<_>, _> = list.iter().map(planner_value).collect();
                if let Ok(values) = values {
                    out.push(Predicate::In { column, values });
                }
            }
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            if let Some(column) = column_name(expr) {
                if let (Ok(low), Ok(high)) = (planner_value(low), planner_value(high)) {
                    out.push(Predicate::Range {
                        column,
                        low: Some(low),
                        high: Some(high),
                    });
                }
            }
        }
        Expr::Nested(inner) => collect_predicates(inner, out),
        _ => {}
    }
}

fn extract_join(select: &Select) -> Option<JoinInfo> {
    let from = select.from.first()?;
    let join = from.joins.first()?;
    let (_, left_table) = table_name(&from.relation);
    let (_, right_table) = table_name(&join.relation);

    let constraint = match &join.join_operator {
        JoinOperator::Inner(JoinConstraint::On(expr)) => expr,
        _ => return None,
    };
    let Expr::BinaryOp { left, op, right } = constraint else {
        return None;
    };
    if *op != BinaryOperator::Eq {
        return None;
    }

    Some(JoinInfo {
        left_table: left_table?,
        right_table: right_table?,
        left_column: column_name(left)?,
        right_column: column_name(right)?,
    })
}

fn extract_aggregates(select: &Select) -> Vec<ParsedAggregate> {
    let mut aggregates = vec![];
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
            _ => continue,
        };
        let Expr::Function(function) = expr else {
            continue;
        };
        let name = function.name.to_string().to_lowercase();
        let aggregate = match name.as_str() {
            "count" => AggregateFunction::Count,
            "sum" => AggregateFunction::Sum,
            "avg" => AggregateFunction::Avg,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            _ => continue,
        };

        let (column, distinct) = match &function.args {
            FunctionArguments::List(list) => {
                let distinct = list.duplicate_treatment == Some(DuplicateTreatment::Distinct);
                let column = match list.args.first() {
                    Some(FunctionArg::Unnamed(FunctionArgExpr::Wildcard)) => "*".to_string(),
                    Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))) => {
                        column_name(expr).unwrap_or_else(|| expr.to_string())
                    }
                    _ => continue,
                };
                (column, distinct)
            }
            _ => continue,
        };

        let alias = alias.unwrap_or_else(|| name.clone());
        aggregates.push(ParsedAggregate {
            function: aggregate,
            column,
            alias,
            distinct,
        });
    }
    aggregates
}

fn extract_group_by(select: &Select) -> Vec<String> {
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => {
            exprs.iter().filter_map(column_name).collect()
        }
        GroupByExpr::All(_) => vec![],
    }
}

fn extract_order_by(query: &Query) -> Vec<SortSpec> {
    let Some(order_by) = &query.order_by else {
        return vec![];
    };
    order_by
        .exprs
        .iter()
        .filter_map(|order| {
            let column = column_name(&order.expr)?;
            Some(SortSpec {
                column,
                descending: order.asc == Some(false),
                nulls_first: order.nulls_first,
            })
        })
        .collect()
}

fn extract_count(expr: Option<&Expr>) -> Option<usize> {
    match expr {
        Some(Expr::Value(Value::Number(text, _))) => text.parse().ok(),
        _ => None,
    }
}
