//! Cross-shard result processing.
//!
//! Everything that happens after per-shard results come back: row
//! concatenation, deduplication, COUNT/SUM/AVG/MIN/MAX merging with
//! GROUP BY, k-way ORDER BY merging with LIMIT/OFFSET, and the streaming
//! accumulator that backs scatter-aggregate plans.

use serde::{Deserialize, Serialize};

pub mod error;
pub mod merge;
pub mod sort;
pub mod stream;

pub use error::Error;
pub use merge::{deduplicate, merge_results};
pub use sort::{merge_sorted, sort_rows};
pub use stream::Aggregator;

/// Aggregate functions the gateway can merge across shards.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// One aggregate in the SELECT list, as seen in the per-shard results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AggregateOp {
    pub function: AggregateFunction,
    /// Column carrying the per-shard partial value.
    pub column: String,
    /// Output column name.
    pub alias: String,
    #[serde(default)]
    pub distinct: bool,
    /// AVG only: per-shard SUM and COUNT columns produced by the
    /// statement rewrite. Averaging per-shard averages is wrong and is
    /// never done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_column: Option<String>,
}

impl AggregateOp {
    pub fn new(function: AggregateFunction, column: &str, alias: &str) -> Self {
        Self {
            function,
            column: column.into(),
            alias: alias.into(),
            distinct: false,
            sum_column: None,
            count_column: None,
        }
    }

    pub fn avg(alias: &str, sum_column: &str, count_column: &str) -> Self {
        Self {
            function: AggregateFunction::Avg,
            column: alias.into(),
            alias: alias.into(),
            distinct: false,
            sum_column: Some(sum_column.into()),
            count_column: Some(count_column.into()),
        }
    }
}

/// One ORDER BY column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
    /// Override the default null collation (nulls last ascending,
    /// first descending).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls_first: Option<bool>,
}

impl SortSpec {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.into(),
            descending: false,
            nulls_first: None,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.into(),
            descending: true,
            nulls_first: None,
        }
    }
}

/// Everything the merge layer needs to reassemble a scatter result.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AggregationContext {
    #[serde(default)]
    pub aggregates: Vec<AggregateOp>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default)]
    pub distinct: bool,
}

impl AggregationContext {
    pub fn is_aggregating(&self) -> bool {
        !self.aggregates.is_empty() || !self.group_by.is_empty()
    }
}

use crate::net::QueryResult;

/// Merge per-shard results under a context. Aggregating contexts run
/// through the streaming accumulator; plain ones concatenate, dedup,
/// k-way merge when sorted, and apply LIMIT/OFFSET.
pub fn aggregate_results(
    results: Vec<QueryResult>,
    context: &AggregationContext,
) -> Result<QueryResult, Error> {
    if context.is_aggregating() {
        let mut aggregator = Aggregator::new(context);
        for result in &results {
            aggregator.add_rows(&result.rows)?;
        }
        return aggregator.finalize();
    }

    // The sorted, non-distinct case is the k-way fast path: the merge
    // stops as soon as offset + limit rows came out. Deduplication has
    // to see every row, so it forces the merge to run to completion
    // before the limit applies.
    if !context.order_by.is_empty() && !context.distinct {
        return Ok(merge_sorted(
            results,
            &context.order_by,
            context.limit,
            context.offset.unwrap_or(0),
        ));
    }

    let mut merged = if context.order_by.is_empty() {
        merge_results(results)
    } else {
        merge_sorted(results, &context.order_by, None, 0)
    };
    if context.distinct {
        merged = deduplicate(merged, None);
    }
    apply_limit(&mut merged, context.limit, context.offset.unwrap_or(0));
    Ok(merged)
}

pub(crate) fn apply_limit(result: &mut QueryResult, limit: Option<usize>, offset: usize) {
    if limit.is_none() && offset == 0 {
        return;
    }
    let rows = std::mem::take(&mut result.rows);
    let end = limit
        .map(|limit| (offset + limit).min(rows.len()))
        .unwrap_or(rows.len());
    result.rows = if offset >= rows.len() {
        vec![]
    } else {
        rows[offset..end].to_vec()
    };
    result.row_count = result.rows.len();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::{row, Datum, Field};

    #[test]
    fn test_plain_concat_with_limit() {
        let results = vec![
            QueryResult::new(
                vec![Field::bigint("id")],
                vec![
                    row(&[("id", Datum::Bigint(1))]),
                    row(&[("id", Datum::Bigint(2))]),
                ],
            ),
            QueryResult::new(vec![Field::bigint("id")], vec![row(&[("id", Datum::Bigint(3))])]),
        ];
        let context = AggregationContext {
            limit: Some(2),
            ..Default::default()
        };
        let merged = aggregate_results(results, &context).unwrap();
        assert_eq!(merged.row_count, 2);
    }

    #[test]
    fn test_distinct_after_merge() {
        let make = |id: i64| {
            QueryResult::new(vec![Field::bigint("id")], vec![row(&[("id", Datum::Bigint(id))])])
        };
        let context = AggregationContext {
            distinct: true,
            ..Default::default()
        };
        let merged = aggregate_results(vec![make(1), make(1), make(2)], &context).unwrap();
        assert_eq!(merged.row_count, 2);
    }
}
