//! Array diff and patch.
//!
//! Diff: trim the common head and tail, run an LCS over the remaining middle,
//! then pair leftover removals with additions as moves.
//!
//! ```text
//!   left   [ h h | a b c d | t ]
//!   right  [ h h | b x d a | t ]
//!                   ^^^^^^^
//!                   LCS over the middle: b, d kept
//!                   a: removed and re-added → move
//!                   c: removed, x: added
//! ```
//!
//! Patch order is fixed: removals and move pick-ups by descending old index,
//! then insertions and move drops by ascending new index, then in-place
//! modifications at new indices.
//!
//! [`fuzzy_patch`] follows the same order on arrays that drifted from the
//! delta's base: removals find their item by value near the recorded index,
//! insertions are clamped to the end, and an item picked up by a move is
//! always put back.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::delta::{type_name, DeltaError, ARRAY_MARKER, OP_ARRAY_MOVE, OP_DELETE};
use crate::diffpatch::{child_path, classify, Change, JsonDiffPatch};

pub(crate) fn diff(engine: &JsonDiffPatch, left: &[Value], right: &[Value]) -> Option<Value> {
    let mut result = Map::new();
    let (len1, len2) = (left.len(), right.len());

    let mut head = 0;
    while head < len1 && head < len2 && engine.items_match(&left[head], &right[head], true) {
        if let Some(nested) = engine.diff_value(&left[head], &right[head]) {
            result.insert(head.to_string(), nested);
        }
        head += 1;
    }

    let mut tail = 0;
    while head + tail < len1 && head + tail < len2 {
        let i1 = len1 - 1 - tail;
        let i2 = len2 - 1 - tail;
        if !engine.items_match(&left[i1], &right[i2], i1 == i2) {
            break;
        }
        if let Some(nested) = engine.diff_value(&left[i1], &right[i2]) {
            result.insert(i2.to_string(), nested);
        }
        tail += 1;
    }

    let end1 = len1 - tail;
    let end2 = len2 - tail;

    if head == end1 {
        for (idx, item) in right.iter().enumerate().take(end2).skip(head) {
            result.insert(idx.to_string(), json!([item]));
        }
    } else if head == end2 {
        for (idx, item) in left.iter().enumerate().take(end1).skip(head) {
            result.insert(format!("_{idx}"), json!([item, OP_DELETE, OP_DELETE]));
        }
    } else {
        diff_middle(engine, left, right, head, end1, end2, &mut result);
    }

    if result.is_empty() {
        return None;
    }
    result.insert("_t".to_string(), Value::String(ARRAY_MARKER.to_string()));
    Some(Value::Object(result))
}

fn diff_middle(
    engine: &JsonDiffPatch,
    left: &[Value],
    right: &[Value],
    head: usize,
    end1: usize,
    end2: usize,
    result: &mut Map<String, Value>,
) {
    let pairs = lcs(engine, &left[head..end1], &right[head..end2]);
    log::trace!(
        "array diff: middle {}x{}, {} kept",
        end1 - head,
        end2 - head,
        pairs.len()
    );

    // new index -> old index for items kept in place
    let kept: HashMap<usize, usize> = pairs.iter().map(|&(a, b)| (head + b, head + a)).collect();
    let kept_old: Vec<bool> = {
        let mut mask = vec![false; end1 - head];
        for &(a, _) in &pairs {
            mask[a] = true;
        }
        mask
    };

    let mut removed = Vec::new();
    for idx in head..end1 {
        if !kept_old[idx - head] {
            result.insert(
                format!("_{idx}"),
                json!([left[idx], OP_DELETE, OP_DELETE]),
            );
            removed.push(idx);
        }
    }

    for idx in head..end2 {
        if let Some(&old) = kept.get(&idx) {
            if let Some(nested) = engine.diff_value(&left[old], &right[idx]) {
                result.insert(idx.to_string(), nested);
            }
            continue;
        }

        let moved_from = if engine.options().detect_move {
            removed
                .iter()
                .position(|&old| engine.items_match(&left[old], &right[idx], false))
                .map(|pos| removed.remove(pos))
        } else {
            None
        };

        match moved_from {
            Some(old) => {
                let carried = if engine.options().include_value_on_move {
                    left[old].clone()
                } else {
                    Value::String(String::new())
                };
                result.insert(format!("_{old}"), json!([carried, idx, OP_ARRAY_MOVE]));
                if let Some(nested) = engine.diff_value(&left[old], &right[idx]) {
                    result.insert(idx.to_string(), nested);
                }
            }
            None => {
                result.insert(idx.to_string(), json!([right[idx]]));
            }
        }
    }
}

/// Longest common subsequence of matching items, as (left, right) index pairs.
fn lcs(engine: &JsonDiffPatch, left: &[Value], right: &[Value]) -> Vec<(usize, usize)> {
    let (n, m) = (left.len(), right.len());
    let mut table = vec![vec![0usize; m + 1]; n + 1];

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if engine.items_match(&left[i], &right[j], false) {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut pairs = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if engine.items_match(&left[i], &right[j], false) {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

pub(crate) fn patch(
    engine: &JsonDiffPatch,
    target: &mut Value,
    delta: Map<String, Value>,
    path: &str,
) -> Result<(), DeltaError> {
    let found = type_name(target);
    let items = target.as_array_mut().ok_or_else(|| DeltaError::TypeMismatch {
        path: path.to_string(),
        expected: "array",
        found,
    })?;

    let mut removals: Vec<(usize, Option<usize>)> = Vec::new();
    let mut insertions: Vec<(usize, Value)> = Vec::new();
    let mut modifications: Vec<(usize, Change)> = Vec::new();

    for (key, entry) in delta {
        if key == "_t" {
            continue;
        }
        let child = child_path(path, &key);
        match key.strip_prefix('_') {
            Some(old) => {
                let index = parse_index(old, path)?;
                match classify(entry, &child)? {
                    Change::Deleted => removals.push((index, None)),
                    Change::Moved(dest) => removals.push((index, Some(dest))),
                    _ => {
                        return Err(DeltaError::Malformed {
                            path: child,
                            reason: "only deletions and moves may use '_' keys".into(),
                        })
                    }
                }
            }
            None => {
                let index = parse_index(&key, path)?;
                match classify(entry, &child)? {
                    Change::Added(value) => insertions.push((index, value)),
                    Change::Moved(_) => {
                        return Err(DeltaError::Malformed {
                            path: child,
                            reason: "move entry without '_' key".into(),
                        })
                    }
                    change => modifications.push((index, change)),
                }
            }
        }
    }

    removals.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, dest) in removals {
        if index >= items.len() {
            return Err(out_of_bounds(path, index, items.len()));
        }
        let item = items.remove(index);
        if let Some(dest) = dest {
            insertions.push((dest, item));
        }
    }

    insertions.sort_by_key(|(index, _)| *index);
    for (index, item) in insertions {
        if index > items.len() {
            return Err(out_of_bounds(path, index, items.len()));
        }
        items.insert(index, item);
    }

    for (index, change) in modifications {
        let len = items.len();
        let slot = items
            .get_mut(index)
            .ok_or_else(|| out_of_bounds(path, index, len))?;
        engine.apply_change(slot, change, &child_path(path, &index.to_string()))?;
    }

    Ok(())
}

/// A removal or move pick-up in a fuzzy patch.
struct Removal {
    index: usize,
    /// Value recorded in the delta, when there is one to match against
    expected: Option<Value>,
    dest: Option<usize>,
}

pub(crate) fn fuzzy_patch(
    engine: &JsonDiffPatch,
    target: &mut Value,
    delta: Map<String, Value>,
    path: &str,
    skipped: &mut Vec<DeltaError>,
) {
    let found = type_name(target);
    let Some(items) = target.as_array_mut() else {
        skipped.push(DeltaError::TypeMismatch {
            path: path.to_string(),
            expected: "array",
            found,
        });
        return;
    };

    let mut removals: Vec<Removal> = Vec::new();
    let mut insertions: Vec<(usize, Value)> = Vec::new();
    let mut modifications: Vec<(usize, Change)> = Vec::new();

    for (key, entry) in delta {
        if key == "_t" {
            continue;
        }
        let child = child_path(path, &key);
        let (raw, removal) = match key.strip_prefix('_') {
            Some(raw) => (raw, true),
            None => (key.as_str(), false),
        };
        let index = match parse_index(raw, path) {
            Ok(index) => index,
            Err(e) => {
                skipped.push(e);
                continue;
            }
        };

        // Moves carry "" unless values were included on diff
        let expected = entry
            .get(0)
            .filter(|v| removal && v.as_str() != Some(""))
            .cloned();

        match (removal, classify(entry, &child)) {
            (_, Err(e)) => skipped.push(e),
            (true, Ok(Change::Deleted)) => removals.push(Removal {
                index,
                expected,
                dest: None,
            }),
            (true, Ok(Change::Moved(dest))) => removals.push(Removal {
                index,
                expected,
                dest: Some(dest),
            }),
            (false, Ok(Change::Added(value))) => insertions.push((index, value)),
            (false, Ok(change @ (Change::Modified(_) | Change::Nested(_)))) => {
                modifications.push((index, change))
            }
            (_, Ok(_)) => skipped.push(DeltaError::Malformed {
                path: child,
                reason: "entry kind does not fit its key".into(),
            }),
        }
    }

    // Resolve every removal against the untouched array first.
    let mut claimed = vec![false; items.len()];
    let mut resolved: Vec<(usize, Option<usize>)> = Vec::new();
    for removal in removals {
        match locate(engine, items, &claimed, &removal) {
            Some(at) => {
                claimed[at] = true;
                resolved.push((at, removal.dest));
            }
            None => skipped.push(DeltaError::Conflict {
                path: child_path(path, &format!("_{}", removal.index)),
                reason: "item to remove is no longer present".into(),
            }),
        }
    }

    resolved.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, dest) in resolved {
        let item = items.remove(index);
        if let Some(dest) = dest {
            insertions.push((dest, item));
        }
    }

    insertions.sort_by_key(|(index, _)| *index);
    for (index, item) in insertions {
        let at = index.min(items.len());
        items.insert(at, item);
    }

    for (index, change) in modifications {
        let len = items.len();
        match items.get_mut(index) {
            Some(slot) => {
                let child = child_path(path, &index.to_string());
                engine.fuzzy_apply_change(slot, change, &child, skipped);
            }
            None => skipped.push(out_of_bounds(path, index, len)),
        }
    }
}

/// Current index of the item a removal refers to.
///
/// With a recorded value, the unclaimed matching item nearest the recorded
/// index wins; without one, only the recorded index itself qualifies.
fn locate(
    engine: &JsonDiffPatch,
    items: &[Value],
    claimed: &[bool],
    removal: &Removal,
) -> Option<usize> {
    let free = |i: usize| i < items.len() && !claimed[i];
    let Some(expected) = &removal.expected else {
        return free(removal.index).then_some(removal.index);
    };

    if free(removal.index) && engine.items_match(&items[removal.index], expected, false) {
        return Some(removal.index);
    }
    (0..items.len())
        .filter(|&i| !claimed[i] && engine.items_match(&items[i], expected, false))
        .min_by_key(|&i| i.abs_diff(removal.index))
}

fn parse_index(raw: &str, path: &str) -> Result<usize, DeltaError> {
    raw.parse().map_err(|_| DeltaError::Malformed {
        path: path.to_string(),
        reason: format!("'{raw}' is not an array index"),
    })
}

fn out_of_bounds(path: &str, index: usize, len: usize) -> DeltaError {
    DeltaError::IndexOutOfBounds {
        path: path.to_string(),
        index,
        len,
    }
}

#[cfg(test)]
mod tests {
    use crate::{Delta, DeltaEngine, DeltaError, DiffOptions, JsonDiffPatch};
    use serde_json::{json, Value};

    fn roundtrip(left: Value, right: Value) -> Delta {
        let engine = JsonDiffPatch::default();
        let delta = engine.diff(&left, &right);
        let mut target = left;
        engine.patch(&mut target, delta.clone()).unwrap();
        assert_eq!(target, right);
        delta
    }

    #[test]
    fn test_append_and_remove_tail() {
        let delta = roundtrip(json!([1, 2]), json!([1, 2, 3]));
        assert_eq!(delta.as_value(), &json!({"_t": "a", "2": [3]}));

        let delta = roundtrip(json!([1, 2, 3]), json!([1, 3]));
        assert_eq!(delta.as_value(), &json!({"_t": "a", "_1": [2, 0, 0]}));
    }

    #[test]
    fn test_replace_in_middle() {
        let delta = roundtrip(json!([1, 2, 3]), json!([1, 9, 3]));
        assert_eq!(delta.as_value(), &json!({"_t": "a", "_1": [2, 0, 0], "1": [9]}));
    }

    #[test]
    fn test_move_by_hash() {
        let left = json!([{"_id": "a", "v": 1}, {"_id": "b"}, {"_id": "c"}]);
        let right = json!([{"_id": "b"}, {"_id": "c"}, {"_id": "a", "v": 1}]);
        let delta = roundtrip(left, right);
        assert_eq!(
            delta.as_value(),
            &json!({"_t": "a", "_0": ["", 2, 3]})
        );
    }

    #[test]
    fn test_move_with_nested_change() {
        let left = json!([{"id": 1, "n": "x"}, {"id": 2}, {"id": 3}]);
        let right = json!([{"id": 2}, {"id": 3}, {"id": 1, "n": "y"}]);
        let delta = roundtrip(left, right);
        assert_eq!(
            delta.as_value(),
            &json!({"_t": "a", "_0": ["", 2, 3], "2": {"n": ["x", "y"]}})
        );
    }

    #[test]
    fn test_moves_disabled() {
        let engine = JsonDiffPatch::new(DiffOptions {
            detect_move: false,
            ..DiffOptions::default()
        });
        let left = json!([{"id": 1}, {"id": 2}]);
        let right = json!([{"id": 2}, {"id": 1}]);
        let delta = engine.diff(&left, &right);
        let raw = delta.as_value().as_object().unwrap();
        assert!(raw.values().all(|v| v.get(2) != Some(&json!(3))));

        let mut target = left;
        engine.patch(&mut target, delta).unwrap();
        assert_eq!(target, right);
    }

    #[test]
    fn test_unhashed_objects_diffed_by_position() {
        let delta = roundtrip(json!([{"c": 1}, {"c": 5}]), json!([{"c": 2}, {"c": 5}]));
        assert_eq!(delta.as_value(), &json!({"_t": "a", "0": {"c": [1, 2]}}));
    }

    #[test]
    fn test_mixed_edits_roundtrip() {
        roundtrip(
            json!(["a", {"id": 1}, "b", {"id": 2, "x": [1, 2]}, "c", "d", "e"]),
            json!(["a", "z", {"id": 2, "x": [2]}, "c", {"id": 1}, "e", "f"]),
        );
        roundtrip(json!([]), json!([[1], [2, [3]]]));
        roundtrip(json!([[1, 2], [3]]), json!([]));
        roundtrip(json!([[1, 2], [3]]), json!([[1, 2, 4], [3]]));
    }

    #[test]
    fn test_patch_index_out_of_bounds() {
        let engine = JsonDiffPatch::default();
        let mut target = json!([1]);
        let delta = Delta::from_value(json!({"_t": "a", "_5": [0, 0, 0]}));
        assert_eq!(
            engine.patch(&mut target, delta),
            Err(DeltaError::IndexOutOfBounds {
                path: String::new(),
                index: 5,
                len: 1,
            })
        );

        let delta = Delta::from_value(json!({"_t": "a", "4": [7]}));
        assert!(matches!(
            engine.patch(&mut target, delta),
            Err(DeltaError::IndexOutOfBounds { index: 4, .. })
        ));
    }

    #[test]
    fn test_fuzzy_removal_finds_shifted_item() {
        let engine = JsonDiffPatch::default();
        // Base was [1, 2, 3]; someone else already removed item 1
        let delta = engine.diff(
            &json!([{"id": 1}, {"id": 2}, {"id": 3}]),
            &json!([{"id": 1}, {"id": 2}]),
        );
        let mut target = json!([{"id": 2}, {"id": 3}]);

        assert!(engine.fuzzy_patch(&mut target, delta).is_empty());
        assert_eq!(target, json!([{"id": 2}]));
    }

    #[test]
    fn test_fuzzy_double_delete_is_skipped() {
        let engine = JsonDiffPatch::default();
        let delta = Delta::from_value(json!({"_t": "a", "_2": [{"id": 3}, 0, 0]}));
        let mut target = json!([{"id": 1}, {"id": 2}]);

        let skipped = engine.fuzzy_patch(&mut target, delta);
        assert!(matches!(skipped[..], [DeltaError::Conflict { .. }]));
        assert_eq!(target, json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn test_fuzzy_move_never_drops_item() {
        let engine = JsonDiffPatch::default();
        let delta = engine.diff(
            &json!([{"id": 1}, {"id": 2}, {"id": 3}]),
            &json!([{"id": 2}, {"id": 3}, {"id": 1}]),
        );
        let mut target = json!([{"id": 1}]);

        assert!(engine.fuzzy_patch(&mut target, delta).is_empty());
        assert_eq!(target, json!([{"id": 1}]));
    }

    #[test]
    fn test_fuzzy_insert_clamped_and_stale_modification_skipped() {
        let engine = JsonDiffPatch::default();
        let delta = Delta::from_value(json!({
            "_t": "a",
            "_2": [3, 0, 0],
            "2": [9],
            "4": {"x": [1, 2]},
        }));
        let mut target = json!([]);

        let skipped = engine.fuzzy_patch(&mut target, delta);
        assert_eq!(target, json!([9]));
        assert_eq!(skipped.len(), 2);
    }

    #[test]
    fn test_patch_array_delta_on_object() {
        let engine = JsonDiffPatch::default();
        let mut target = json!({"list": {"k": 1}});
        let delta = Delta::from_value(json!({"list": {"_t": "a", "0": [1]}}));
        assert!(matches!(
            engine.patch(&mut target, delta),
            Err(DeltaError::TypeMismatch { expected: "array", .. })
        ));
    }
}
