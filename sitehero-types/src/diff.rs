//! Shallow JSON object diffing.
//!
//! Payloads are flat-ish JSON objects; diffs work on top-level fields only.
//! A nested object counts as a single field.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Applies `patch` on top of `base`, field by field. Fields in `patch` win.
///
/// A non-object `patch` replaces `base` entirely. A non-object `base` is
/// treated as empty.
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    let Some(patch_fields) = patch.as_object() else {
        return patch.clone();
    };
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    for (key, value) in patch_fields {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

/// Top-level fields whose value differs between `base` and `current`.
///
/// Removed fields count as changed. With no base every field of `current`
/// is considered changed.
pub fn changed_fields(base: Option<&Value>, current: &Value) -> BTreeSet<String> {
    let empty = Map::new();
    let base_fields = base.and_then(Value::as_object).unwrap_or(&empty);
    let current_fields = current.as_object().unwrap_or(&empty);

    let mut changed = BTreeSet::new();
    for (key, value) in current_fields {
        if base_fields.get(key) != Some(value) {
            changed.insert(key.clone());
        }
    }
    for key in base_fields.keys() {
        if !current_fields.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn merge_patch_overlays_fields() {
        let base = json!({"title": "Slab pour", "status": "open", "crew": 4});
        let patch = json!({"status": "closed"});
        assert_eq!(
            merge_patch(&base, &patch),
            json!({"title": "Slab pour", "status": "closed", "crew": 4})
        );
    }

    #[test]
    fn merge_patch_on_non_object_base() {
        assert_eq!(merge_patch(&Value::Null, &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn changed_fields_detects_edits_and_removals() {
        let base = json!({"a": 1, "b": 2, "c": 3});
        let current = json!({"a": 1, "b": 20, "d": 4});
        let changed: Vec<_> = changed_fields(Some(&base), &current).into_iter().collect();
        assert_eq!(changed, vec!["b", "c", "d"]);
    }

    #[test]
    fn changed_fields_without_base_is_everything() {
        let changed = changed_fields(None, &json!({"x": 1, "y": 2}));
        assert_eq!(changed.len(), 2);
    }
}
