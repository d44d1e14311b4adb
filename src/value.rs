//! Canonical typed property values shared by the store, the entity layer,
//! and the projection engine.
//!
//! Values are tagged with explicit type information so the stored form
//! remains unambiguous: ordering and type are recoverable without the
//! caller re-declaring them.
#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{RegistryError, Result};

/// A typed scalar property value.
///
/// Containers (object/map/array) are flattened into leaf rows by the entity
/// layer; the `Empty*` variants are explicit markers so an empty container
/// round-trips through storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum PropValue {
    /// Explicit null (an `any`-typed attribute set to null).
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer (epochs, counters).
    UInt(u64),
    /// 64-bit decimal.
    Decimal(f64),
    /// UTF-8 string (also urls and xids).
    String(String),
    /// RFC 3339 timestamp, stored normalized.
    Timestamp(String),
    /// Marker for an object attribute with no members.
    EmptyObject,
    /// Marker for a map attribute with no entries.
    EmptyMap,
    /// Marker for an array attribute with no elements.
    EmptyArray,
}

impl PropValue {
    /// Storage type tag for this value.
    pub fn kind(&self) -> &'static str {
        match self {
            PropValue::Null => "null",
            PropValue::Bool(_) => "boolean",
            PropValue::Int(_) => "integer",
            PropValue::UInt(_) => "uinteger",
            PropValue::Decimal(_) => "decimal",
            PropValue::String(_) => "string",
            PropValue::Timestamp(_) => "timestamp",
            PropValue::EmptyObject => "object",
            PropValue::EmptyMap => "map",
            PropValue::EmptyArray => "array",
        }
    }

    /// Encode the scalar payload for storage.
    pub fn storage_json(&self) -> String {
        let json = self.to_json();
        serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string())
    }

    /// Decode a value from its storage `(kind, json)` columns.
    pub fn from_storage(kind: &str, json: &str) -> Result<PropValue> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| RegistryError::Storage(format!("corrupt property payload: {e}")))?;
        let decoded = match (kind, &value) {
            ("null", _) => PropValue::Null,
            ("boolean", serde_json::Value::Bool(b)) => PropValue::Bool(*b),
            ("integer", serde_json::Value::Number(n)) => {
                PropValue::Int(n.as_i64().unwrap_or_default())
            }
            ("uinteger", serde_json::Value::Number(n)) => {
                PropValue::UInt(n.as_u64().unwrap_or_default())
            }
            ("decimal", serde_json::Value::Number(n)) => {
                PropValue::Decimal(n.as_f64().unwrap_or_default())
            }
            ("string", serde_json::Value::String(s)) => PropValue::String(s.clone()),
            ("timestamp", serde_json::Value::String(s)) => PropValue::Timestamp(s.clone()),
            ("object", _) => PropValue::EmptyObject,
            ("map", _) => PropValue::EmptyMap,
            ("array", _) => PropValue::EmptyArray,
            _ => {
                return Err(RegistryError::Storage(format!(
                    "property kind '{kind}' does not match payload {json}"
                )))
            }
        };
        Ok(decoded)
    }

    /// Render this value as JSON for serialization.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropValue::Null => serde_json::Value::Null,
            PropValue::Bool(b) => serde_json::Value::Bool(*b),
            PropValue::Int(i) => serde_json::Value::from(*i),
            PropValue::UInt(u) => serde_json::Value::from(*u),
            PropValue::Decimal(d) => {
                serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            PropValue::String(s) | PropValue::Timestamp(s) => serde_json::Value::String(s.clone()),
            PropValue::EmptyObject | PropValue::EmptyMap => {
                serde_json::Value::Object(serde_json::Map::new())
            }
            PropValue::EmptyArray => serde_json::Value::Array(Vec::new()),
        }
    }

    /// Infer a typed value from untyped JSON (used for `any`-typed and
    /// undeclared custom attributes).
    pub fn infer(value: &serde_json::Value) -> Option<PropValue> {
        match value {
            serde_json::Value::Null => Some(PropValue::Null),
            serde_json::Value::Bool(b) => Some(PropValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(PropValue::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(PropValue::UInt(u))
                } else {
                    n.as_f64().map(PropValue::Decimal)
                }
            }
            serde_json::Value::String(s) => Some(PropValue::String(s.clone())),
            _ => None,
        }
    }

    /// String form used for filter comparisons: the raw string for strings,
    /// the JSON rendering otherwise.
    pub fn as_filter_string(&self) -> String {
        match self {
            PropValue::String(s) | PropValue::Timestamp(s) => s.clone(),
            other => other.storage_json(),
        }
    }

    /// Numeric view of the value, if it has one.
    fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Int(i) => Some(*i as f64),
            PropValue::UInt(u) => Some(*u as f64),
            PropValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Type-aware comparison used by the sort engine.
    ///
    /// Strings compare case-insensitively — a fold-equal pair is a genuine
    /// tie, left for the caller's id tiebreak — numerics numerically
    /// across integer/uinteger/decimal, timestamps chronologically,
    /// booleans with `false < true`. Values of unrelated types fall back
    /// to comparing their type tags so the order stays stable.
    pub fn compare(&self, other: &PropValue) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }
        match (self, other) {
            (PropValue::Bool(a), PropValue::Bool(b)) => a.cmp(b),
            (PropValue::String(a), PropValue::String(b)) => fold_cmp(a, b),
            (PropValue::Timestamp(a), PropValue::Timestamp(b)) => {
                match (parse_rfc3339(a), parse_rfc3339(b)) {
                    (Some(ta), Some(tb)) => ta.cmp(&tb),
                    _ => fold_cmp(a, b),
                }
            }
            (PropValue::String(a), PropValue::Timestamp(b))
            | (PropValue::Timestamp(a), PropValue::String(b)) => fold_cmp(a, b),
            (a, b) => a.kind().cmp(b.kind()),
        }
    }
}

fn fold_cmp(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// Case-insensitive string ordering with a case-sensitive tiebreak so the
/// order stays total.
pub fn compare_ci(a: &str, b: &str) -> Ordering {
    match a.to_lowercase().cmp(&b.to_lowercase()) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

/// Current time, normalized to the registry's stored timestamp form.
pub fn now_timestamp() -> Result<String> {
    let ts = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .map_err(|e| RegistryError::Storage(format!("clock error: {e}")))?;
    Ok(ts.format(&Rfc3339)?)
}

/// Validate and normalize a caller-supplied timestamp.
pub fn normalize_timestamp(s: &str) -> Result<String> {
    let ts = OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|_| RegistryError::bad_request(format!("malformed timestamp: {s}")))?;
    Ok(ts.format(&Rfc3339)?)
}
