//! JSON-Pointer patch codec (RFC 6901 subset used by JMAP `PatchObject`s).
//!
//! Arrays are never recursed into; a changed array is always replaced
//! wholesale. See `MethodCallSet::update`'s restrictions in the wire layer
//! for the corresponding server-side rules this codec has to stay
//! compatible with.

use std::collections::HashMap;

use serde_json::Value;

/// A `JSON-Pointer → replacement` map. `None` means delete the property.
pub type Patch = HashMap<String, Option<Value>>;

/// Escape a single path component: `~` → `~0`, then `/` → `~1`. Order
/// matters; reversing it would turn an original `~1` into `/`.
pub fn encode_component(component: &str) -> String {
    component.replace('~', "~0").replace('/', "~1")
}

/// Reverse of `encode_component`: `~1` → `/`, then `~0` → `~`.
pub fn decode_component(component: &str) -> String {
    component.replace("~1", "/").replace("~0", "~")
}

fn join_path(base_path: &str, key: &str) -> String {
    format!("{base_path}/{}", encode_component(key))
}

/// Recursively diff `original` against `current`, writing one entry into
/// `patches` per differing leaf.
///
/// - If both values are objects, recurse over the union of keys; a key
///   missing from `current` emits a deletion (`null`).
/// - Otherwise, if the two values are not structurally equal, record
///   `patches[basePath] = current` (or `null` if `current` is absent).
/// - Arrays are never recursed into: a changed array is replaced as a whole.
///
/// Returns `true` if any patch was recorded.
pub fn make_patches(base_path: &str, patches: &mut Patch, original: &Value, current: &Value) -> bool {
    match (original.as_object(), current.as_object()) {
        (Some(original_map), Some(current_map)) => {
            let mut did_patch = false;
            let mut keys: Vec<&String> = original_map.keys().collect();
            for key in current_map.keys() {
                if !original_map.contains_key(key) {
                    keys.push(key);
                }
            }
            for key in keys {
                let path = join_path(base_path, key);
                match current_map.get(key) {
                    Some(current_value) => {
                        let original_value = original_map.get(key).unwrap_or(&Value::Null);
                        if make_patches(&path, patches, original_value, current_value) {
                            did_patch = true;
                        }
                    }
                    None => {
                        patches.insert(path, None);
                        did_patch = true;
                    }
                }
            }
            did_patch
        }
        _ => {
            if original != current {
                patches.insert(base_path.to_string(), Some(current.clone()));
                true
            } else {
                false
            }
        }
    }
}

/// Apply a single `(path, patch)` pair to `object` in place. Walks `path`
/// component by component; on the terminal component, sets `patch` if
/// `Some`, else removes the key. If any intermediate component does not
/// resolve to an object, the patch is silently dropped.
pub fn apply_patch(object: &mut Value, path: &str, patch: Option<&Value>) {
    let components: Vec<String> = split_path(path);
    let Some((last, prefix)) = components.split_last() else {
        return;
    };

    let mut cursor = object;
    for component in prefix {
        match cursor.get_mut(component) {
            Some(next) if next.is_object() => cursor = next,
            _ => return,
        }
    }

    let Some(map) = cursor.as_object_mut() else {
        return;
    };
    match patch {
        Some(value) => {
            map.insert(last.clone(), value.clone());
        }
        None => {
            map.remove(last);
        }
    }
}

/// Same walk as `apply_patch`, but only checks resolvability: `false` if any
/// intermediate component is missing, `true` once the final component is
/// reached (the final key itself need not already exist).
pub fn is_valid_patch(object: &Value, path: &str) -> bool {
    let components = split_path(path);
    let Some((_, prefix)) = components.split_last() else {
        return false;
    };

    let mut cursor = object;
    for component in prefix {
        match cursor.get(component) {
            Some(next) if next.is_object() => cursor = next,
            _ => return false,
        }
    }
    true
}

fn split_path(path: &str) -> Vec<String> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .map(decode_component)
        .collect()
}
