//! Payload shaper: pure key transforms over arbitrary JSON trees.
//!
//! A backend descriptor may delete keys the upstream rejects, add
//! defaults it requires, and rename keys to its own vocabulary. Each
//! transform returns a fresh tree; composition order is
//! delete -> add -> rename.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::config::BackendCfg;

/// Recursively remove any map entry whose key is in `names`.
pub fn delete_keys(tree: &Value, names: &[String]) -> Value {
    if names.is_empty() {
        return tree.clone();
    }
    match tree {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if names.iter().any(|n| n == key) {
                    continue;
                }
                out.insert(key.clone(), delete_keys(value, names));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| delete_keys(v, names)).collect())
        }
        other => other.clone(),
    }
}

/// Recursively set defaults on every map node. Existing keys win.
pub fn add_defaults(tree: &Value, additions: &Map<String, Value>) -> Value {
    if additions.is_empty() {
        return tree.clone();
    }
    match tree {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), add_defaults(value, additions));
            }
            for (key, value) in additions {
                if !out.contains_key(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| add_defaults(v, additions)).collect())
        }
        other => other.clone(),
    }
}

/// Recursively substitute map keys using `renames`; values are renamed too.
pub fn rename_keys(tree: &Value, renames: &BTreeMap<String, String>) -> Value {
    if renames.is_empty() {
        return tree.clone();
    }
    match tree {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let name = renames.get(key).cloned().unwrap_or_else(|| key.clone());
                out.insert(name, rename_keys(value, renames));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| rename_keys(v, renames)).collect())
        }
        other => other.clone(),
    }
}

/// Apply a backend's transforms in the canonical order. Deletion strips
/// incompatible fields first, addition supplies required defaults without
/// clobbering caller values, and rename adapts to upstream naming last.
pub fn apply_transforms(tree: &Value, backend: &BackendCfg) -> Value {
    if !backend.has_transforms() {
        return tree.clone();
    }
    let deleted = delete_keys(tree, &backend.key_delete);
    let added = add_defaults(&deleted, &backend.key_add);
    rename_keys(&added, &backend.key_rename)
}
