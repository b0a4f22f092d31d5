//! Forgiving JSON helpers for the wire boundary.

use serde::Serialize;

/// Parse JSON, `None` instead of an error on malformed input.
pub fn safe_json_parse(text: &str) -> Option<serde_json::Value> {
    serde_json::from_str(text).ok()
}

/// Stringify, `None` when the value cannot be represented (the cyclic
/// case of dynamic languages maps to serialization failure here).
pub fn safe_json_stringify<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}
