//! Typed values.
//!
//! Wire values arrive as JSON scalars. Inside the gateway they are promoted
//! to a discriminated union so aggregation and sorting can be exact about
//! numeric width and null handling.

use std::cmp::Ordering;
use std::fmt::Display;

use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A single column value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Datum {
    #[default]
    Null,
    Boolean(bool),
    /// All integer widths; preserved exactly through aggregation.
    Bigint(i64),
    Double(f64),
    /// Exact decimal, used for NUMERIC columns and overflow-safe sums.
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

/// Parse an ISO-8601-ish timestamp out of a string, if it looks like one.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    None
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Numeric view for arithmetic, when the datum has one.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Datum::Bigint(value) => Some(Decimal::from(*value)),
            Datum::Double(value) => Decimal::from_f64_retain(*value),
            Datum::Numeric(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Bigint(value) => Some(*value),
            Datum::Double(value) if value.fract() == 0.0 => Some(*value as i64),
            Datum::Numeric(value) => value.to_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Bigint(value) => Some(*value as f64),
            Datum::Double(value) => Some(*value),
            Datum::Numeric(value) => value.to_f64(),
            _ => None,
        }
    }

    /// Timestamp view; ISO-8601 strings qualify.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Datum::Timestamp(value) => Some(*value),
            Datum::Text(text) => parse_timestamp(text),
            _ => None,
        }
    }

    /// Stable rendering used for group keys and as the ordering of last
    /// resort. Distinct values render distinctly within a type.
    pub fn stable_text(&self) -> String {
        match self {
            Datum::Null => "\0null".into(),
            Datum::Boolean(value) => format!("b:{}", value),
            Datum::Bigint(value) => format!("n:{}", value),
            Datum::Double(value) => format!("n:{}", value),
            Datum::Numeric(value) => format!("n:{}", value.normalize()),
            Datum::Text(value) => format!("t:{}", value),
            Datum::Bytes(value) => {
                use base64::Engine;
                format!(
                    "x:{}",
                    base64::engine::general_purpose::STANDARD.encode(value)
                )
            }
            Datum::Timestamp(value) => format!("ts:{}", value.format("%Y-%m-%dT%H:%M:%S%.f")),
            Datum::Json(value) => format!("j:{}", value),
        }
    }
}

impl Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(value) => write!(f, "{}", value),
            Datum::Bigint(value) => write!(f, "{}", value),
            Datum::Double(value) => write!(f, "{}", value),
            Datum::Numeric(value) => write!(f, "{}", value),
            Datum::Text(value) => write!(f, "{}", value),
            Datum::Bytes(value) => write!(f, "\\x{}", hex(value)),
            Datum::Timestamp(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S%.f")),
            Datum::Json(value) => write!(f, "{}", value),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Datum::Bigint(value)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Double(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::Text(value.into())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::Text(value)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Boolean(value)
    }
}

/// Cross-type ordering used by MIN/MAX and ORDER BY, nulls excluded.
///
/// Numbers compare arithmetically, strings bytewise, timestamps by instant.
/// Two strings that both parse as timestamps compare as timestamps.
/// Anything else falls back to comparing the stable rendering.
pub fn compare_values(a: &Datum, b: &Datum) -> Ordering {
    use Datum::*;

    match (a, b) {
        (Bigint(x), Bigint(y)) => x.cmp(y),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (Text(x), Text(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Bytes(x), Bytes(y)) => x.cmp(y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_decimal(), b.as_decimal()) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (a.as_timestamp(), b.as_timestamp()) {
                return x.cmp(&y);
            }
            a.stable_text().cmp(&b.stable_text())
        }
    }
}

/// Full ordering including nulls. Default null collation: last ascending,
/// first descending; `nulls_first` overrides it.
pub fn compare_with_nulls(
    a: &Datum,
    b: &Datum,
    descending: bool,
    nulls_first: Option<bool>,
) -> Ordering {
    let nulls_first = nulls_first.unwrap_or(descending);
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ordering = compare_values(a, b);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Datum::Null => serializer.serialize_unit(),
            Datum::Boolean(value) => serializer.serialize_bool(*value),
            Datum::Bigint(value) => serializer.serialize_i64(*value),
            Datum::Double(value) => serializer.serialize_f64(*value),
            Datum::Numeric(value) => serializer.serialize_str(&value.normalize().to_string()),
            Datum::Text(value) => serializer.serialize_str(value),
            Datum::Bytes(value) => {
                use base64::Engine;
                serializer
                    .serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
            }
            Datum::Timestamp(value) => {
                serializer.serialize_str(&value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            Datum::Json(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Datum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Datum::from_json(value))
    }
}

impl Datum {
    /// Promote a wire JSON scalar. Strings stay strings; the boundary that
    /// knows the field type (aggregation, sorting) re-classifies them.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Boolean(b),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Datum::Bigint(int)
                } else {
                    Datum::Double(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => Datum::Text(text),
            other => Datum::Json(other),
        }
    }
}
