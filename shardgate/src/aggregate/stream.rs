//! Streaming accumulator for scatter-aggregate plans.
//!
//! Shard batches arrive in any order; state is one accumulator per group
//! per aggregate, never the raw rows. AVG merges strictly from per-shard
//! SUM and COUNT partials.

use std::collections::HashSet;

use indexmap::IndexMap;
use rust_decimal::Decimal;

use crate::net::{compare_values, DataType, Datum, Field, QueryResult, Row};

use super::error::Error;
use super::sort::sort_rows;
use super::{apply_limit, AggregateFunction, AggregateOp, AggregationContext};

/// Overflow-safe running sum. Integer inputs stay integers until they no
/// longer fit, then promote to exact decimals; floats stay floats.
#[derive(Debug, Default, Clone)]
enum SumValue {
    #[default]
    Empty,
    Int(i64),
    Decimal(Decimal),
    Float(f64),
}

impl SumValue {
    fn add(&mut self, value: &Datum) -> Result<(), Error> {
        let next = match (&*self, value) {
            (SumValue::Empty, Datum::Bigint(v)) => SumValue::Int(*v),
            (SumValue::Empty, Datum::Double(v)) => SumValue::Float(*v),
            (SumValue::Empty, Datum::Numeric(v)) => SumValue::Decimal(*v),

            (SumValue::Int(total), Datum::Bigint(v)) => match total.checked_add(*v) {
                Some(sum) => SumValue::Int(sum),
                None => SumValue::Decimal(Decimal::from(*total) + Decimal::from(*v)),
            },
            (SumValue::Int(total), Datum::Double(v)) => SumValue::Float(*total as f64 + v),
            (SumValue::Int(total), Datum::Numeric(v)) => {
                SumValue::Decimal(Decimal::from(*total) + v)
            }

            (SumValue::Decimal(total), Datum::Bigint(v)) => {
                SumValue::Decimal(total + Decimal::from(*v))
            }
            (SumValue::Decimal(total), Datum::Numeric(v)) => SumValue::Decimal(total + v),
            (SumValue::Decimal(total), Datum::Double(v)) => {
                use rust_decimal::prelude::ToPrimitive;
                SumValue::Float(total.to_f64().unwrap_or(f64::NAN) + v)
            }

            (SumValue::Float(total), other) => match other.as_f64() {
                Some(v) => SumValue::Float(total + v),
                None => return Err(Error::NotSummable("non-numeric")),
            },

            (_, Datum::Text(_)) => return Err(Error::NotSummable("text")),
            (_, Datum::Boolean(_)) => return Err(Error::NotSummable("boolean")),
            _ => return Err(Error::NotSummable("non-numeric")),
        };
        *self = next;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        matches!(self, SumValue::Empty)
    }

    fn into_datum(self) -> Datum {
        match self {
            SumValue::Empty => Datum::Null,
            SumValue::Int(total) => Datum::Bigint(total),
            SumValue::Decimal(total) => Datum::Numeric(total),
            SumValue::Float(total) => Datum::Double(total),
        }
    }

    fn divide(self, count: i64) -> Datum {
        if count == 0 {
            return Datum::Null;
        }
        match self {
            SumValue::Empty => Datum::Null,
            SumValue::Int(total) => {
                if total % count == 0 {
                    Datum::Bigint(total / count)
                } else {
                    Datum::Numeric(Decimal::from(total) / Decimal::from(count))
                }
            }
            SumValue::Decimal(total) => Datum::Numeric(total / Decimal::from(count)),
            SumValue::Float(total) => Datum::Double(total / count as f64),
        }
    }
}

#[derive(Debug)]
enum AccState {
    Count { total: i64 },
    CountDistinct { seen: HashSet<String> },
    Sum { sum: SumValue },
    Avg { sum: SumValue, count: i64 },
    MinMax { best: Option<Datum>, max: bool },
}

impl AccState {
    fn new(op: &AggregateOp) -> Self {
        match op.function {
            AggregateFunction::Count if op.distinct => AccState::CountDistinct {
                seen: HashSet::new(),
            },
            AggregateFunction::Count => AccState::Count { total: 0 },
            AggregateFunction::Sum => AccState::Sum {
                sum: SumValue::default(),
            },
            AggregateFunction::Avg => AccState::Avg {
                sum: SumValue::default(),
                count: 0,
            },
            AggregateFunction::Min => AccState::MinMax {
                best: None,
                max: false,
            },
            AggregateFunction::Max => AccState::MinMax {
                best: None,
                max: true,
            },
        }
    }

    fn update(&mut self, row: &Row, op: &AggregateOp) -> Result<(), Error> {
        match self {
            AccState::Count { total } => {
                let value = row.get(&op.column).unwrap_or(&Datum::Null);
                if let Some(partial) = value.as_i64() {
                    *total += partial;
                }
            }
            AccState::CountDistinct { seen } => {
                // Shards return their local DISTINCT values; the union of
                // the value sets is counted at finalize.
                let value = row.get(&op.column).unwrap_or(&Datum::Null);
                if !value.is_null() {
                    seen.insert(value.stable_text());
                }
            }
            AccState::Sum { sum } => {
                let value = row.get(&op.column).unwrap_or(&Datum::Null);
                if !value.is_null() {
                    sum.add(value)?;
                }
            }
            AccState::Avg { sum, count } => {
                let sum_column = op.sum_column.as_deref().ok_or(
                    Error::MissingHelperColumns {
                        function: "avg",
                        missing: "sum",
                    },
                )?;
                let count_column =
                    op.count_column
                        .as_deref()
                        .ok_or(Error::MissingHelperColumns {
                            function: "avg",
                            missing: "count",
                        })?;

                let partial_count = row
                    .get(count_column)
                    .and_then(|value| value.as_i64())
                    .unwrap_or(0);
                if partial_count == 0 {
                    return Ok(());
                }
                let partial_sum = row.get(sum_column).unwrap_or(&Datum::Null);
                if !partial_sum.is_null() {
                    sum.add(partial_sum)?;
                    *count += partial_count;
                }
            }
            AccState::MinMax { best, max } => {
                let value = row.get(&op.column).unwrap_or(&Datum::Null);
                if value.is_null() {
                    return Ok(());
                }
                let better = match best {
                    None => true,
                    Some(current) => {
                        let ordering = compare_values(value, current);
                        if *max {
                            ordering == std::cmp::Ordering::Greater
                        } else {
                            ordering == std::cmp::Ordering::Less
                        }
                    }
                };
                if better {
                    *best = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    fn finalize(self) -> Datum {
        match self {
            AccState::Count { total } => Datum::Bigint(total),
            AccState::CountDistinct { seen } => Datum::Bigint(seen.len() as i64),
            AccState::Sum { sum } => sum.into_datum(),
            AccState::Avg { sum, count } => {
                if sum.is_empty() {
                    Datum::Null
                } else {
                    sum.divide(count)
                }
            }
            AccState::MinMax { best, .. } => best.unwrap_or(Datum::Null),
        }
    }
}

struct Group {
    keys: Vec<Datum>,
    accumulators: Vec<AccState>,
}

/// Order-independent accumulator over shard batches. State is
/// `O(groups × aggregations)`; raw rows are never buffered.
pub struct Aggregator {
    context: AggregationContext,
    groups: IndexMap<String, Group>,
}

impl Aggregator {
    pub fn new(context: &AggregationContext) -> Self {
        let mut aggregator = Self {
            context: context.clone(),
            groups: IndexMap::new(),
        };
        // Without GROUP BY there is exactly one output row, even over
        // zero input rows (COUNT of nothing is 0).
        if context.group_by.is_empty() {
            aggregator.groups.insert(
                String::new(),
                Group {
                    keys: vec![],
                    accumulators: context.aggregates.iter().map(AccState::new).collect(),
                },
            );
        }
        aggregator
    }

    /// Feed one shard batch. Batches may arrive in any order.
    pub fn add_rows(&mut self, rows: &[Row]) -> Result<(), Error> {
        for row in rows {
            let mut key = String::new();
            let mut keys = Vec::with_capacity(self.context.group_by.len());
            for column in &self.context.group_by {
                let value = row.get(column).cloned().unwrap_or(Datum::Null);
                key.push_str(&value.stable_text());
                key.push('\u{1f}');
                keys.push(value);
            }

            let aggregates = &self.context.aggregates;
            let group = self.groups.entry(key).or_insert_with(|| Group {
                keys,
                accumulators: aggregates.iter().map(AccState::new).collect(),
            });

            for (accumulator, op) in group.accumulators.iter_mut().zip(aggregates) {
                accumulator.update(row, op)?;
            }
        }
        Ok(())
    }

    /// Produce the merged result: group columns first, aggregate aliases
    /// after, sorted and limited when the context says so.
    pub fn finalize(self) -> Result<QueryResult, Error> {
        let context = self.context;
        let mut rows: Vec<Row> = Vec::with_capacity(self.groups.len());

        for (_, group) in self.groups {
            let mut row = Row::new();
            for (column, value) in context.group_by.iter().zip(group.keys) {
                row.insert(column.clone(), value);
            }
            for (accumulator, op) in group.accumulators.into_iter().zip(&context.aggregates) {
                row.insert(op.alias.clone(), accumulator.finalize());
            }
            rows.push(row);
        }

        if !context.order_by.is_empty() {
            sort_rows(&mut rows, &context.order_by);
        }

        let fields = fields_from_rows(&context, &rows);
        let mut result = QueryResult::new(fields, rows);
        apply_limit(
            &mut result,
            context.limit,
            context.offset.unwrap_or(0),
        );
        Ok(result)
    }
}

fn infer_type(value: &Datum) -> DataType {
    match value {
        Datum::Boolean(_) => DataType::Bool,
        Datum::Bigint(_) => DataType::Bigint,
        Datum::Double(_) => DataType::Float,
        Datum::Numeric(_) => DataType::Numeric,
        Datum::Text(_) => DataType::Text,
        Datum::Bytes(_) => DataType::Bytea,
        Datum::Timestamp(_) => DataType::Timestamp,
        Datum::Json(_) => DataType::Json,
        Datum::Null => DataType::Unknown,
    }
}

fn fields_from_rows(context: &AggregationContext, rows: &[Row]) -> Vec<Field> {
    let sample = rows.first();
    let type_of = |name: &str, fallback: DataType| {
        sample
            .and_then(|row| row.get(name))
            .map(infer_type)
            .filter(|inferred| *inferred != DataType::Unknown)
            .unwrap_or(fallback)
    };

    let mut fields = Vec::with_capacity(context.group_by.len() + context.aggregates.len());
    for column in &context.group_by {
        fields.push(Field::new(column, type_of(column, DataType::Unknown)));
    }
    for op in &context.aggregates {
        let fallback = match op.function {
            AggregateFunction::Count => DataType::Bigint,
            _ => DataType::Unknown,
        };
        fields.push(Field::new(&op.alias, type_of(&op.alias, fallback)));
    }
    fields
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::row;

    fn count_context() -> AggregationContext {
        AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Count, "count", "count")],
            ..Default::default()
        }
    }

    #[test]
    fn test_count_across_four_shards() {
        let mut aggregator = Aggregator::new(&count_context());
        for partial in [100_i64, 200, 150, 50] {
            aggregator
                .add_rows(&[row(&[("count", Datum::Bigint(partial))])])
                .unwrap();
        }
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.scalar("count"), Some(&Datum::Bigint(500)));
    }

    #[test]
    fn test_count_of_nothing_is_zero() {
        let aggregator = Aggregator::new(&count_context());
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("count"), Some(&Datum::Bigint(0)));
    }

    #[test]
    fn test_avg_from_sum_and_count_partials() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::avg("avg", "sum", "count")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        for (sum, count) in [(30_i64, 2_i64), (40, 8), (0, 0), (0, 0)] {
            aggregator
                .add_rows(&[row(&[
                    ("sum", Datum::Bigint(sum)),
                    ("count", Datum::Bigint(count)),
                ])])
                .unwrap();
        }
        let result = aggregator.finalize().unwrap();
        // 70 / 10, never the average of the per-shard averages (10).
        assert_eq!(result.scalar("avg"), Some(&Datum::Bigint(7)));
    }

    #[test]
    fn test_avg_of_nothing_is_null() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::avg("avg", "sum", "count")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        aggregator
            .add_rows(&[row(&[("sum", Datum::Null), ("count", Datum::Bigint(0))])])
            .unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("avg"), Some(&Datum::Null));
    }

    #[test]
    fn test_min_skips_nulls() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Min, "min", "min")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        aggregator.add_rows(&[row(&[("min", Datum::Null)])]).unwrap();
        aggregator
            .add_rows(&[row(&[("min", Datum::Bigint(100))])])
            .unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("min"), Some(&Datum::Bigint(100)));

        // All nulls stay null.
        let mut aggregator = Aggregator::new(&context);
        aggregator.add_rows(&[row(&[("min", Datum::Null)])]).unwrap();
        aggregator.add_rows(&[row(&[("min", Datum::Null)])]).unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("min"), Some(&Datum::Null));
    }

    #[test]
    fn test_sum_preserves_bigint_and_survives_overflow() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Sum, "sum", "sum")],
            ..Default::default()
        };

        let mut aggregator = Aggregator::new(&context);
        aggregator
            .add_rows(&[row(&[("sum", Datum::Bigint(2))])])
            .unwrap();
        aggregator
            .add_rows(&[row(&[("sum", Datum::Bigint(3))])])
            .unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("sum"), Some(&Datum::Bigint(5)));

        let mut aggregator = Aggregator::new(&context);
        aggregator
            .add_rows(&[row(&[("sum", Datum::Bigint(i64::MAX))])])
            .unwrap();
        aggregator
            .add_rows(&[row(&[("sum", Datum::Bigint(1))])])
            .unwrap();
        let result = aggregator.finalize().unwrap();
        let expected = Decimal::from(i64::MAX) + Decimal::from(1);
        assert_eq!(result.scalar("sum"), Some(&Datum::Numeric(expected)));
    }

    #[test]
    fn test_sum_all_nulls_is_null() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Sum, "sum", "sum")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        aggregator.add_rows(&[row(&[("sum", Datum::Null)])]).unwrap();
        aggregator.add_rows(&[row(&[("sum", Datum::Null)])]).unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("sum"), Some(&Datum::Null));
    }

    #[test]
    fn test_sum_is_order_independent() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Sum, "s", "s")],
            ..Default::default()
        };
        let batches = [
            vec![row(&[("s", Datum::Bigint(10))])],
            vec![row(&[("s", Datum::Bigint(-3))])],
            vec![row(&[("s", Datum::Bigint(8))])],
        ];

        let mut forward = Aggregator::new(&context);
        for batch in &batches {
            forward.add_rows(batch).unwrap();
        }
        let mut backward = Aggregator::new(&context);
        for batch in batches.iter().rev() {
            backward.add_rows(batch).unwrap();
        }

        assert_eq!(
            forward.finalize().unwrap().scalar("s"),
            backward.finalize().unwrap().scalar("s")
        );
    }

    #[test]
    fn test_group_by_partitions() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Sum, "total", "total")],
            group_by: vec!["region".into()],
            order_by: vec![super::super::SortSpec::asc("region")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        aggregator
            .add_rows(&[
                row(&[("region", Datum::Text("eu".into())), ("total", Datum::Bigint(5))]),
                row(&[("region", Datum::Text("us".into())), ("total", Datum::Bigint(7))]),
            ])
            .unwrap();
        aggregator
            .add_rows(&[row(&[
                ("region", Datum::Text("eu".into())),
                ("total", Datum::Bigint(2)),
            ])])
            .unwrap();

        let result = aggregator.finalize().unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0].get("region"), Some(&Datum::Text("eu".into())));
        assert_eq!(result.rows[0].get("total"), Some(&Datum::Bigint(7)));
        assert_eq!(result.rows[1].get("total"), Some(&Datum::Bigint(7)));
        // Output schema: group columns then aggregates.
        assert_eq!(result.fields[0].name, "region");
        assert_eq!(result.fields[1].name, "total");
    }

    #[test]
    fn test_count_distinct_unions_shard_sets() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp {
                distinct: true,
                ..AggregateOp::new(AggregateFunction::Count, "city", "count")
            }],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        // Shard 1 saw {london, paris}, shard 2 saw {paris, berlin}.
        aggregator
            .add_rows(&[
                row(&[("city", Datum::Text("london".into()))]),
                row(&[("city", Datum::Text("paris".into()))]),
            ])
            .unwrap();
        aggregator
            .add_rows(&[
                row(&[("city", Datum::Text("paris".into()))]),
                row(&[("city", Datum::Text("berlin".into()))]),
            ])
            .unwrap();
        let result = aggregator.finalize().unwrap();
        assert_eq!(result.scalar("count"), Some(&Datum::Bigint(3)));
    }

    #[test]
    fn test_avg_without_helpers_fails() {
        let context = AggregationContext {
            aggregates: vec![AggregateOp::new(AggregateFunction::Avg, "avg", "avg")],
            ..Default::default()
        };
        let mut aggregator = Aggregator::new(&context);
        let err = aggregator
            .add_rows(&[row(&[("avg", Datum::Double(10.0))])])
            .unwrap_err();
        assert!(matches!(err, Error::MissingHelperColumns { .. }));
    }
}
