//! Delta type, engine trait and options.
//!
//! Delta layout (jsondiffpatch format):
//! ```text
//! added        [new]
//! modified     [old, new]
//! deleted      [old, 0, 0]
//! object       { key: delta, ... }
//! array        { "_t": "a", "N": delta at new index N,
//!                "_N": [old, 0, 0] | ["", dest, 3] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Document;

/// Marker stored under `_t` in array deltas.
pub(crate) const ARRAY_MARKER: &str = "a";
/// Third element of a deletion triple.
pub(crate) const OP_DELETE: u64 = 0;
/// Third element of a text-diff triple (not produced, rejected on patch).
pub(crate) const OP_TEXT_DIFF: u64 = 2;
/// Third element of an array move triple.
pub(crate) const OP_ARRAY_MOVE: u64 = 3;

/// A structural difference between two documents.
///
/// `Delta::empty()` (serialized as `null`) means "no change".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta(Value);

impl Delta {
    /// The delta that changes nothing.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    /// Wrap a raw jsondiffpatch value.
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// True for `null`, `{}` and an array delta with no entries.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.keys().all(|k| k == "_t"),
            _ => false,
        }
    }
}

impl From<Option<Value>> for Delta {
    fn from(value: Option<Value>) -> Self {
        Self(value.unwrap_or(Value::Null))
    }
}

/// Errors raised while applying a delta.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeltaError {
    #[error("delta expects {expected} at '{path}', found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("key '{key}' missing at '{path}'")]
    MissingKey { path: String, key: String },

    #[error("array index {index} out of bounds (len {len}) at '{path}'")]
    IndexOutOfBounds { path: String, index: usize, len: usize },

    #[error("malformed delta at '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("text diffs are not supported (at '{0}')")]
    UnsupportedTextDiff(String),

    /// The target drifted from the delta's base and the entry no longer applies.
    #[error("entry at '{path}' conflicts with target: {reason}")]
    Conflict { path: String, reason: String },
}

/// Diff behaviour knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Object fields used as identity when matching array items, in priority order.
    pub object_hash_keys: Vec<String>,
    /// Record array items that changed position as moves instead of remove + add.
    pub detect_move: bool,
    /// Carry the moved value inside move triples.
    pub include_value_on_move: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            object_hash_keys: vec!["_id".to_string(), "id".to_string()],
            detect_move: true,
            include_value_on_move: false,
        }
    }
}

/// Pluggable diff/patch capability used by both sync engines.
pub trait DeltaEngine: Send + Sync {
    /// Compute the delta that turns `left` into `right`.
    fn diff(&self, left: &Document, right: &Document) -> Delta;

    /// Apply `delta` to `target` in place. The delta is consumed.
    ///
    /// On error `target` is left unchanged.
    fn patch(&self, target: &mut Document, delta: Delta) -> Result<(), DeltaError>;

    /// Apply as much of `delta` as still fits a `target` that may have moved
    /// away from the delta's base. Returns the entries that were skipped.
    fn fuzzy_patch(&self, target: &mut Document, delta: Delta) -> Vec<DeltaError> {
        match self.patch(target, delta) {
            Ok(()) => Vec::new(),
            Err(e) => vec![e],
        }
    }

    fn is_empty(&self, delta: &Delta) -> bool {
        delta.is_empty()
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_variants() {
        assert!(Delta::empty().is_empty());
        assert!(Delta::from_value(json!({})).is_empty());
        assert!(Delta::from_value(json!({"_t": "a"})).is_empty());
        assert!(!Delta::from_value(json!({"a": [1, 2]})).is_empty());
        assert!(!Delta::from_value(json!([1])).is_empty());
    }

    #[test]
    fn test_empty_serializes_as_null() {
        let encoded = serde_json::to_string(&Delta::empty()).unwrap();
        assert_eq!(encoded, "null");
        let decoded: Delta = serde_json::from_str("null").unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_default_options() {
        let opts = DiffOptions::default();
        assert_eq!(opts.object_hash_keys, vec!["_id", "id"]);
        assert!(opts.detect_move);
        assert!(!opts.include_value_on_move);
    }

    #[test]
    fn test_error_display() {
        let err = DeltaError::IndexOutOfBounds {
            path: "/b".into(),
            index: 4,
            len: 2,
        };
        assert_eq!(err.to_string(), "array index 4 out of bounds (len 2) at '/b'");
    }
}
