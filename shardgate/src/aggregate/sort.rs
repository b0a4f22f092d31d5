//! Sorting and the k-way merge.
//!
//! When a scatter carries ORDER BY, every shard pre-sorts by the same
//! columns and the gateway merges the sorted streams, popping the minimum
//! head until `offset + limit` rows came out. Ties break by shard index,
//! so the merged order is deterministic regardless of completion order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::net::{compare_with_nulls, Datum, QueryResult, Row};

use super::SortSpec;

/// Sort rows in place by the given columns.
pub fn sort_rows(rows: &mut [Row], order_by: &[SortSpec]) {
    rows.sort_by(|a, b| compare_rows(a, b, order_by));
}

pub(crate) fn compare_rows(a: &Row, b: &Row, order_by: &[SortSpec]) -> Ordering {
    for spec in order_by {
        let left = a.get(&spec.column).unwrap_or(&Datum::Null);
        let right = b.get(&spec.column).unwrap_or(&Datum::Null);
        let ordering = compare_with_nulls(left, right, spec.descending, spec.nulls_first);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Head of one shard stream, ordered by its sort key then shard index.
struct Head {
    key: Vec<(Datum, bool, Option<bool>)>,
    stream: usize,
    position: usize,
}

impl Head {
    fn new(row: &Row, order_by: &[SortSpec], stream: usize, position: usize) -> Self {
        let key = order_by
            .iter()
            .map(|spec| {
                (
                    row.get(&spec.column).cloned().unwrap_or(Datum::Null),
                    spec.descending,
                    spec.nulls_first,
                )
            })
            .collect();
        Self {
            key,
            stream,
            position,
        }
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((left, descending, nulls_first), (right, _, _)) in self.key.iter().zip(&other.key) {
            let ordering = compare_with_nulls(left, right, *descending, *nulls_first);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.stream
            .cmp(&other.stream)
            .then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

/// Merge per-shard pre-sorted results into one sorted result, stopping
/// once `offset + limit` rows have been produced. Work per emitted row is
/// one heap pop and push: `O((offset + limit) · log k)` comparisons.
pub fn merge_sorted(
    streams: Vec<QueryResult>,
    order_by: &[SortSpec],
    limit: Option<usize>,
    offset: usize,
) -> QueryResult {
    let mut merged = QueryResult::empty();
    for stream in &streams {
        if merged.fields.is_empty() && !stream.fields.is_empty() {
            merged.fields = stream.fields.clone();
        }
    }

    let needed = limit.map(|limit| offset + limit);
    let mut heap: BinaryHeap<Reverse<Head>> = BinaryHeap::with_capacity(streams.len());
    for (index, stream) in streams.iter().enumerate() {
        if let Some(row) = stream.rows.first() {
            heap.push(Reverse(Head::new(row, order_by, index, 0)));
        }
    }

    let mut produced = 0usize;
    let mut rows = Vec::new();
    while let Some(Reverse(head)) = heap.pop() {
        let stream = &streams[head.stream];
        if produced >= offset {
            rows.push(stream.rows[head.position].clone());
        }
        produced += 1;
        if let Some(needed) = needed {
            if produced >= needed {
                break;
            }
        }
        let next = head.position + 1;
        if next < stream.rows.len() {
            heap.push(Reverse(Head::new(
                &stream.rows[next],
                order_by,
                head.stream,
                next,
            )));
        }
    }

    merged.row_count = rows.len();
    merged.rows = rows;
    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::{row, Field};

    fn stream(ids: &[i64]) -> QueryResult {
        QueryResult::new(
            vec![Field::bigint("id")],
            ids.iter().map(|id| row(&[("id", Datum::Bigint(*id))])).collect(),
        )
    }

    fn ids(result: &QueryResult) -> Vec<i64> {
        result
            .rows
            .iter()
            .map(|row| match row.get("id") {
                Some(Datum::Bigint(id)) => *id,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_three_way_merge_with_limit() {
        let streams = vec![stream(&[1, 5, 9]), stream(&[2, 4, 8]), stream(&[3, 6, 7])];
        let order = vec![SortSpec::asc("id")];

        let merged = merge_sorted(streams.clone(), &order, Some(3), 0);
        assert_eq!(ids(&merged), vec![1, 2, 3]);

        let merged = merge_sorted(streams, &order, Some(9), 0);
        assert_eq!(ids(&merged), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_offset_skips_prefix() {
        let streams = vec![stream(&[1, 3]), stream(&[2, 4])];
        let merged = merge_sorted(streams, &[SortSpec::asc("id")], Some(2), 1);
        assert_eq!(ids(&merged), vec![2, 3]);
    }

    #[test]
    fn test_offset_past_end() {
        let streams = vec![stream(&[1]), stream(&[2])];
        let merged = merge_sorted(streams, &[SortSpec::asc("id")], Some(5), 10);
        assert!(merged.rows.is_empty());
    }

    #[test]
    fn test_descending() {
        let streams = vec![stream(&[9, 5, 1]), stream(&[8, 4, 2])];
        let merged = merge_sorted(streams, &[SortSpec::desc("id")], Some(4), 0);
        assert_eq!(ids(&merged), vec![9, 8, 5, 4]);
    }

    #[test]
    fn test_ties_break_by_stream_index() {
        let streams = vec![stream(&[1, 1]), stream(&[1])];
        let merged = merge_sorted(streams, &[SortSpec::asc("id")], None, 0);
        assert_eq!(merged.row_count, 3);
        // All equal keys: stream 0 drains before stream 1.
        assert_eq!(ids(&merged), vec![1, 1, 1]);
    }

    #[test]
    fn test_exact_output_size() {
        // min(limit, total - offset) rows, never more.
        let streams = vec![stream(&[1, 2]), stream(&[3])];
        let merged = merge_sorted(streams, &[SortSpec::asc("id")], Some(10), 1);
        assert_eq!(merged.row_count, 2);
    }

    #[test]
    fn test_nulls_last_ascending() {
        // Each stream pre-sorted ascending with nulls last.
        let first = QueryResult::new(
            vec![Field::bigint("id")],
            vec![row(&[("id", Datum::Bigint(7))]), row(&[("id", Datum::Null)])],
        );
        let second = QueryResult::new(
            vec![Field::bigint("id")],
            vec![row(&[("id", Datum::Bigint(3))]), row(&[("id", Datum::Null)])],
        );
        let merged = merge_sorted(vec![first, second], &[SortSpec::asc("id")], None, 0);
        assert_eq!(merged.rows[0].get("id"), Some(&Datum::Bigint(3)));
        assert_eq!(merged.rows[1].get("id"), Some(&Datum::Bigint(7)));
        assert!(merged.rows[2].get("id").unwrap().is_null());
        assert!(merged.rows[3].get("id").unwrap().is_null());
    }

    #[test]
    fn test_sort_rows_multi_column() {
        let mut rows = vec![
            row(&[("a", Datum::Bigint(1)), ("b", Datum::Text("y".into()))]),
            row(&[("a", Datum::Bigint(1)), ("b", Datum::Text("x".into()))]),
            row(&[("a", Datum::Bigint(0)), ("b", Datum::Text("z".into()))]),
        ];
        sort_rows(
            &mut rows,
            &[SortSpec::asc("a"), SortSpec::asc("b")],
        );
        assert_eq!(rows[0].get("b"), Some(&Datum::Text("z".into())));
        assert_eq!(rows[1].get("b"), Some(&Datum::Text("x".into())));
    }
}
