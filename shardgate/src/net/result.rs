//! Query and execute result shapes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::value::Datum;

/// One result row: ordered column → value map. Null database values are
/// present, explicitly null.
pub type Row = IndexMap<String, Datum>;

/// Canonical column types. Engine-native type codes map onto these.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Bigint,
    Float,
    Numeric,
    Text,
    Bool,
    Json,
    Date,
    Time,
    Timestamp,
    Uuid,
    Bytea,
    #[default]
    Unknown,
}

/// Column descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
}

impl Field {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            native_type: None,
        }
    }

    pub fn bigint(name: &str) -> Self {
        Self::new(name, DataType::Bigint)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, DataType::Float)
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, DataType::Text)
    }

    pub fn numeric(name: &str) -> Self {
        Self::new(name, DataType::Numeric)
    }
}

/// Rows returned by a read.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub fields: Vec<Field>,
    /// Milliseconds, when the engine reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl QueryResult {
    pub fn new(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self {
            rows,
            row_count,
            fields,
            duration: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a named column in the field list.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Values of one column across all rows, missing cells as null.
    pub fn column(&self, name: &str) -> Vec<Datum> {
        self.rows
            .iter()
            .map(|row| row.get(name).cloned().unwrap_or(Datum::Null))
            .collect()
    }

    /// First row's value for a column, for single-row results.
    pub fn scalar(&self, name: &str) -> Option<&Datum> {
        self.rows.first().and_then(|row| row.get(name))
    }
}

/// Auto-generated key of an insert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InsertId {
    Int(i64),
    Text(String),
}

/// Outcome of a write.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    pub affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<InsertId>,
}

impl ExecuteResult {
    pub fn new(affected: u64) -> Self {
        Self {
            affected,
            last_insert_id: None,
        }
    }
}

/// Outcome of a batch; execution stops at the first failure.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub results: Vec<QueryResult>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build a row from `(column, value)` pairs.
pub fn row(columns: &[(&str, Datum)]) -> Row {
    columns
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}
