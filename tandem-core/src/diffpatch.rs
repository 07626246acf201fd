//! jsondiffpatch-compatible delta engine.
//!
//! Scalars and type changes produce `[old, new]`, objects recurse key by key,
//! arrays are handled in [`crate::array`]. Error paths are JSON pointers.

use serde_json::{json, Map, Value};

use crate::array;
use crate::delta::{
    type_name, Delta, DeltaEngine, DeltaError, DiffOptions, ARRAY_MARKER, OP_ARRAY_MOVE,
    OP_DELETE, OP_TEXT_DIFF,
};
use crate::Document;

/// One decoded delta entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    Added(Value),
    Modified(Value),
    Deleted,
    Moved(usize),
    Nested(Map<String, Value>),
}

/// Default [`DeltaEngine`]: structural JSON diff with move-aware arrays.
#[derive(Debug, Clone, Default)]
pub struct JsonDiffPatch {
    options: DiffOptions,
}

impl JsonDiffPatch {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Identity of an array item: the first configured hash key present on an object.
    pub(crate) fn object_hash<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let obj = value.as_object()?;
        self.options
            .object_hash_keys
            .iter()
            .find_map(|key| obj.get(key).filter(|v| !v.is_null()))
    }

    /// Whether two array items denote the same element.
    ///
    /// `same_position` allows unhashed containers at the same index to match
    /// so they are diffed in place (head/tail trimming only).
    pub(crate) fn items_match(&self, left: &Value, right: &Value, same_position: bool) -> bool {
        if left == right {
            return true;
        }
        match (left, right) {
            (Value::Object(_), Value::Object(_)) => {
                match (self.object_hash(left), self.object_hash(right)) {
                    (Some(a), Some(b)) => a == b,
                    _ => same_position,
                }
            }
            (Value::Array(_), Value::Array(_)) => same_position,
            _ => false,
        }
    }

    pub(crate) fn diff_value(&self, left: &Value, right: &Value) -> Option<Value> {
        if left == right {
            return None;
        }
        match (left, right) {
            (Value::Object(l), Value::Object(r)) => self.diff_object(l, r),
            (Value::Array(l), Value::Array(r)) => array::diff(self, l, r),
            _ => Some(json!([left, right])),
        }
    }

    fn diff_object(&self, left: &Map<String, Value>, right: &Map<String, Value>) -> Option<Value> {
        let mut result = Map::new();

        for (key, old) in left {
            match right.get(key) {
                Some(new) => {
                    if let Some(nested) = self.diff_value(old, new) {
                        result.insert(key.clone(), nested);
                    }
                }
                None => {
                    result.insert(key.clone(), json!([old, OP_DELETE, OP_DELETE]));
                }
            }
        }

        for (key, new) in right {
            if !left.contains_key(key) {
                result.insert(key.clone(), json!([new]));
            }
        }

        if result.is_empty() {
            None
        } else {
            Some(Value::Object(result))
        }
    }

    pub(crate) fn patch_value(
        &self,
        target: &mut Value,
        delta: Value,
        path: &str,
    ) -> Result<(), DeltaError> {
        let change = classify(delta, path)?;
        self.apply_change(target, change, path)
    }

    pub(crate) fn apply_change(
        &self,
        target: &mut Value,
        change: Change,
        path: &str,
    ) -> Result<(), DeltaError> {
        match change {
            Change::Added(value) | Change::Modified(value) => {
                *target = value;
                Ok(())
            }
            Change::Deleted => {
                *target = Value::Null;
                Ok(())
            }
            Change::Moved(_) => Err(DeltaError::Malformed {
                path: path.to_string(),
                reason: "move entry outside of an array delta".into(),
            }),
            Change::Nested(map) => {
                if map.get("_t").and_then(Value::as_str) == Some(ARRAY_MARKER) {
                    array::patch(self, target, map, path)
                } else {
                    self.patch_object(target, map, path)
                }
            }
        }
    }

    fn patch_object(
        &self,
        target: &mut Value,
        delta: Map<String, Value>,
        path: &str,
    ) -> Result<(), DeltaError> {
        let found = type_name(target);
        let obj = target.as_object_mut().ok_or_else(|| DeltaError::TypeMismatch {
            path: path.to_string(),
            expected: "object",
            found,
        })?;

        for (key, entry) in delta {
            let child = child_path(path, &key);
            match classify(entry, &child)? {
                Change::Deleted => {
                    obj.remove(&key);
                }
                Change::Added(value) | Change::Modified(value) => {
                    obj.insert(key, value);
                }
                nested => {
                    let slot = obj.get_mut(&key).ok_or_else(|| DeltaError::MissingKey {
                        path: path.to_string(),
                        key: key.clone(),
                    })?;
                    self.apply_change(slot, nested, &child)?;
                }
            }
        }
        Ok(())
    }

    /// Lenient counterpart of [`JsonDiffPatch::apply_change`]: conflicts are
    /// collected into `skipped` and the rest of the delta still applies.
    pub(crate) fn fuzzy_apply_change(
        &self,
        target: &mut Value,
        change: Change,
        path: &str,
        skipped: &mut Vec<DeltaError>,
    ) {
        match change {
            Change::Added(value) | Change::Modified(value) => *target = value,
            Change::Deleted => *target = Value::Null,
            Change::Moved(_) => skipped.push(DeltaError::Malformed {
                path: path.to_string(),
                reason: "move entry outside of an array delta".into(),
            }),
            Change::Nested(map) => {
                if map.get("_t").and_then(Value::as_str) == Some(ARRAY_MARKER) {
                    array::fuzzy_patch(self, target, map, path, skipped);
                } else {
                    self.fuzzy_patch_object(target, map, path, skipped);
                }
            }
        }
    }

    fn fuzzy_patch_object(
        &self,
        target: &mut Value,
        delta: Map<String, Value>,
        path: &str,
        skipped: &mut Vec<DeltaError>,
    ) {
        let found = type_name(target);
        let Some(obj) = target.as_object_mut() else {
            skipped.push(DeltaError::TypeMismatch {
                path: path.to_string(),
                expected: "object",
                found,
            });
            return;
        };

        for (key, entry) in delta {
            let child = child_path(path, &key);
            match classify(entry, &child) {
                Ok(Change::Deleted) => {
                    obj.remove(&key);
                }
                Ok(Change::Added(value) | Change::Modified(value)) => {
                    obj.insert(key, value);
                }
                Ok(nested) => match obj.get_mut(&key) {
                    Some(slot) => self.fuzzy_apply_change(slot, nested, &child, skipped),
                    None => skipped.push(DeltaError::MissingKey {
                        path: path.to_string(),
                        key,
                    }),
                },
                Err(e) => skipped.push(e),
            }
        }
    }
}

impl DeltaEngine for JsonDiffPatch {
    fn diff(&self, left: &Document, right: &Document) -> Delta {
        Delta::from(self.diff_value(left, right))
    }

    fn patch(&self, target: &mut Document, delta: Delta) -> Result<(), DeltaError> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut patched = target.clone();
        self.patch_value(&mut patched, delta.into_value(), "")?;
        *target = patched;
        Ok(())
    }

    fn fuzzy_patch(&self, target: &mut Document, delta: Delta) -> Vec<DeltaError> {
        let mut skipped = Vec::new();
        if delta.is_empty() {
            return skipped;
        }
        match classify(delta.into_value(), "") {
            Ok(change) => self.fuzzy_apply_change(target, change, "", &mut skipped),
            Err(e) => skipped.push(e),
        }
        if !skipped.is_empty() {
            log::trace!("fuzzy patch skipped {} entries", skipped.len());
        }
        skipped
    }
}

pub(crate) fn child_path(path: &str, key: &str) -> String {
    format!("{path}/{key}")
}

/// Decode one delta entry.
pub(crate) fn classify(delta: Value, path: &str) -> Result<Change, DeltaError> {
    match delta {
        Value::Array(mut parts) => match parts.len() {
            1 => Ok(Change::Added(parts.swap_remove(0))),
            2 => Ok(Change::Modified(parts.swap_remove(1))),
            3 => match parts[2].as_u64() {
                Some(OP_DELETE) => Ok(Change::Deleted),
                Some(OP_ARRAY_MOVE) => parts[1]
                    .as_u64()
                    .map(|dest| Change::Moved(dest as usize))
                    .ok_or_else(|| DeltaError::Malformed {
                        path: path.to_string(),
                        reason: "move destination is not an index".into(),
                    }),
                Some(OP_TEXT_DIFF) => Err(DeltaError::UnsupportedTextDiff(path.to_string())),
                _ => Err(DeltaError::Malformed {
                    path: path.to_string(),
                    reason: format!("unknown operation {}", parts[2]),
                }),
            },
            n => Err(DeltaError::Malformed {
                path: path.to_string(),
                reason: format!("entry of length {n}"),
            }),
        },
        Value::Object(map) => Ok(Change::Nested(map)),
        other => Err(DeltaError::Malformed {
            path: path.to_string(),
            reason: format!("unexpected {} entry", type_name(&other)),
        }),
    }
}
