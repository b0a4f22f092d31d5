//! Row concatenation and deduplication.

use std::collections::HashSet;

use crate::net::{QueryResult, Row};

/// Concatenate per-shard results in input order. The field descriptor of
/// the first non-empty result wins; row counts add up.
pub fn merge_results(results: Vec<QueryResult>) -> QueryResult {
    let mut merged = QueryResult::empty();

    for result in results {
        if merged.fields.is_empty() && !result.fields.is_empty() {
            merged.fields = result.fields;
        }
        merged.row_count += result.row_count;
        merged.rows.extend(result.rows);
    }

    merged
}

fn row_key(row: &Row, columns: Option<&[String]>) -> String {
    let mut key = String::new();
    match columns {
        Some(columns) => {
            for column in columns {
                if let Some(value) = row.get(column) {
                    key.push_str(&value.stable_text());
                }
                key.push('\u{1f}');
            }
        }
        None => {
            for (name, value) in row {
                key.push_str(name);
                key.push('=');
                key.push_str(&value.stable_text());
                key.push('\u{1f}');
            }
        }
    }
    key
}

/// Keep the first occurrence of each row, judged by the named columns or
/// the whole row. Stable with respect to input order.
pub fn deduplicate(result: QueryResult, columns: Option<&[String]>) -> QueryResult {
    let mut seen = HashSet::new();
    let mut deduped = QueryResult {
        fields: result.fields,
        duration: result.duration,
        ..Default::default()
    };

    for row in result.rows {
        if seen.insert(row_key(&row, columns)) {
            deduped.rows.push(row);
        }
    }
    deduped.row_count = deduped.rows.len();
    deduped
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::{row, Datum, Field};

    fn result(ids: &[i64]) -> QueryResult {
        QueryResult::new(
            vec![Field::bigint("id"), Field::text("name")],
            ids.iter()
                .map(|id| {
                    row(&[
                        ("id", Datum::Bigint(*id)),
                        ("name", Datum::Text(format!("user{}", id))),
                    ])
                })
                .collect(),
        )
    }

    #[test]
    fn test_merge_concatenates_in_order() {
        let merged = merge_results(vec![result(&[1, 2]), result(&[3]), result(&[4, 5])]);
        assert_eq!(merged.row_count, 5);
        assert_eq!(
            merged.column("id"),
            vec![
                Datum::Bigint(1),
                Datum::Bigint(2),
                Datum::Bigint(3),
                Datum::Bigint(4),
                Datum::Bigint(5)
            ]
        );
    }

    #[test]
    fn test_merge_takes_first_nonempty_fields() {
        let empty = QueryResult::empty();
        let merged = merge_results(vec![empty, result(&[1])]);
        assert_eq!(merged.fields.len(), 2);
        assert_eq!(merged.fields[0].name, "id");
    }

    #[test]
    fn test_dedup_whole_row() {
        let mut duplicated = merge_results(vec![result(&[1, 2]), result(&[1, 2, 3])]);
        duplicated.rows.push(duplicated.rows[0].clone());

        let deduped = deduplicate(duplicated, None);
        assert_eq!(deduped.row_count, 3);
        assert_eq!(
            deduped.column("id"),
            vec![Datum::Bigint(1), Datum::Bigint(2), Datum::Bigint(3)]
        );
    }

    #[test]
    fn test_dedup_by_columns_keeps_first() {
        let mixed = QueryResult::new(
            vec![Field::bigint("id"), Field::text("name")],
            vec![
                row(&[("id", Datum::Bigint(1)), ("name", Datum::Text("first".into()))]),
                row(&[("id", Datum::Bigint(1)), ("name", Datum::Text("second".into()))]),
                row(&[("id", Datum::Bigint(2)), ("name", Datum::Text("third".into()))]),
            ],
        );
        let columns = vec!["id".to_string()];
        let deduped = deduplicate(mixed, Some(&columns));
        assert_eq!(deduped.row_count, 2);
        assert_eq!(
            deduped.column("name"),
            vec![Datum::Text("first".into()), Datum::Text("third".into())]
        );
    }

    #[test]
    fn test_dedup_distinguishes_null_from_text() {
        let mixed = QueryResult::new(
            vec![Field::text("name")],
            vec![
                row(&[("name", Datum::Null)]),
                row(&[("name", Datum::Text("null".into()))]),
                row(&[("name", Datum::Null)]),
            ],
        );
        let deduped = deduplicate(mixed, None);
        assert_eq!(deduped.row_count, 2);
    }
}
