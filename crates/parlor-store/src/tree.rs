//! JSON tree operations backing the in-memory store.
//!
//! Empty objects and `null` never persist: deleting the last child of a node
//! deletes the node, and reading an empty node yields `None`.

use parlor_types::ids::validate_key;
use parlor_types::paths::{self, CONNECTED};
use parlor_types::updates::is_server_timestamp;
use serde_json::{Map, Value};

use crate::StoreError;

/// Validate a path used for writes. The root and `.info/` are read-only.
pub fn validate_write_path(path: &str) -> Result<(), StoreError> {
    if paths::segments(path).next().is_none() || path == CONNECTED {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason: "read-only location".into(),
        });
    }
    validate_path(path)
}

/// Validate a path used for reads and watches.
pub fn validate_path(path: &str) -> Result<(), StoreError> {
    if path == CONNECTED {
        return Ok(());
    }
    for segment in paths::segments(path) {
        validate_key(segment).map_err(|e| StoreError::InvalidPath {
            path: path.to_string(),
            reason: e.reason.to_string(),
        })?;
    }
    Ok(())
}

/// `path` with empty segments and stray slashes removed.
pub fn canonical(path: &str) -> String {
    paths::segments(path).collect::<Vec<_>>().join("/")
}

/// Value at `path`, `None` when absent or empty.
pub fn get(root: &Value, path: &str) -> Option<Value> {
    let mut node = root;
    for segment in paths::segments(path) {
        node = node.as_object()?.get(segment)?;
    }
    match node {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Set `path` to `value`; `null` (or an empty object) deletes it.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = paths::segments(path).collect();
    match normalize(value) {
        Some(value) => set_at(root, &segments, value),
        None => {
            remove_at(root, &segments);
        }
    }
}

fn set_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        set_at(child, rest, value);
    }
}

/// Returns true when `node` is left empty and should be pruned by its parent.
fn remove_at(node: &mut Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        *node = Value::Null;
        return true;
    };

    let Value::Object(map) = node else {
        return false;
    };

    let prune = match map.get_mut(*first) {
        Some(child) => remove_at(child, rest),
        None => false,
    };
    if prune {
        map.remove(*first);
    }
    map.is_empty()
}

/// Drop nulls and empty objects, recursively.
pub fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

/// Replace server timestamp placeholders with `now_ms`.
pub fn resolve_server_values(value: Value, now_ms: i64) -> Value {
    if is_server_timestamp(&value) {
        return Value::from(now_ms);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_server_values(v, now_ms)))
                .collect(),
        ),
        other => other,
    }
}

/// Flatten `value` into `(path, leaf)` pairs below `prefix`.
pub fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{}/{}", prefix, key), child, out);
            }
        }
        Value::Null => {}
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}
