// propsd: Property tree helpers
// Deep merge, dotted-path access, and content signatures over serde_json values

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Deep-merge `overlay` into `dest`.
///
/// Mappings merge recursively; every other value (scalars, sequences, null)
/// replaces the destination wholesale. Later overlays therefore win at leaf
/// collisions, which is the merge order contract the storage layer relies on.
pub fn deep_merge(dest: &mut Value, overlay: &Value) {
    match (dest, overlay) {
        (Value::Object(dest_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match dest_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, overlay) => {
            *dest = overlay.clone();
        }
    }
}

/// Look up a dotted path (`a.b.c`) in a property tree.
///
/// Sequences are not descended into; a path segment landing on anything but
/// a mapping terminates the lookup.
pub fn get_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = tree;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set `value` at `path` inside `tree`, creating intermediate mappings.
///
/// A non-mapping encountered along the way is replaced by a mapping.
pub fn set_path(tree: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *tree = value;
        return;
    }
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let mut current = tree;
    for segment in &path[..path.len() - 1] {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        let entry = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    if let Value::Object(map) = current {
        map.insert(path[path.len() - 1].clone(), value);
    }
}

/// Content signature: SHA-1 over the canonical JSON form of a value.
///
/// Canonical means mapping keys are recursively sorted, so two trees that
/// differ only in insertion order produce the same signature.
pub fn signature(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_later_mapping_wins_at_leaves() {
        // Arrange: two trees colliding at a leaf
        let mut dest = json!({"a": {"b": 1, "keep": true}, "top": "x"});
        let overlay = json!({"a": {"b": 2}, "top": "y"});

        // Act
        deep_merge(&mut dest, &overlay);

        // Assert: overlay wins at collisions, untouched keys survive
        assert_eq!(dest, json!({"a": {"b": 2, "keep": true}, "top": "y"}));
    }

    #[test]
    fn merge_replaces_sequences_wholesale() {
        let mut dest = json!({"list": [1, 2, 3]});
        deep_merge(&mut dest, &json!({"list": [9]}));
        assert_eq!(dest, json!({"list": [9]}));
    }

    #[test]
    fn merge_scalar_over_mapping_replaces() {
        let mut dest = json!({"a": {"nested": 1}});
        deep_merge(&mut dest, &json!({"a": "flat"}));
        assert_eq!(dest, json!({"a": "flat"}));
    }

    #[test]
    fn get_path_walks_mappings_only() {
        let tree = json!({"instance": {"account": "12345", "tags": ["a"]}});
        assert_eq!(
            get_path(&tree, "instance.account"),
            Some(&json!("12345"))
        );
        assert_eq!(get_path(&tree, "instance.missing"), None);
        // Sequences are not descended into
        assert_eq!(get_path(&tree, "instance.tags.0"), None);
    }

    #[test]
    fn set_path_creates_intermediate_mappings() {
        let mut tree = json!({});
        set_path(
            &mut tree,
            &["a".to_string(), "b".to_string(), "c".to_string()],
            json!("toor"),
        );
        assert_eq!(tree, json!({"a": {"b": {"c": "toor"}}}));
    }

    #[test]
    fn signature_is_stable_under_key_order() {
        let first = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let second = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(signature(&first), signature(&second));
    }

    #[test]
    fn signature_differs_for_different_trees() {
        assert_ne!(
            signature(&json!({"a": 1})),
            signature(&json!({"a": 2}))
        );
    }
}
