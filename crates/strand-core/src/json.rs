//! Attribute flattening for dynamically-typed JSON payloads.
//!
//! Properties and outputs cross the storage boundary as flat attribute maps
//! (dotted keys represent JSON paths) so a columnar backend can index them.
//! [`flatten`] and [`unflatten`] convert between the tree and attribute
//! representations. Array elements flatten with their index as a path
//! segment (`items.0`, `items.1`, ...).

use serde_json::{Map, Value};

/// Flattens a JSON tree into dotted-path attributes.
///
/// Scalars map to themselves under the empty path. Objects and arrays
/// recurse, joining path segments with `.`. Empty objects and arrays are
/// dropped (they carry no attribute values).
#[must_use]
pub fn flatten(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(path: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = join_path(path, key);
                flatten_into(&child_path, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let child_path = join_path(path, &index.to_string());
                flatten_into(&child_path, child, out);
            }
        }
        scalar => {
            out.insert(path.to_string(), scalar.clone());
        }
    }
}

fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

/// Rebuilds a JSON tree from dotted-path attributes.
///
/// Path segments that parse as `usize` recreate array positions when every
/// sibling segment at that level is numeric; otherwise segments become
/// object keys. A scalar stored under the empty path is returned as-is.
#[must_use]
pub fn unflatten(attributes: &Map<String, Value>) -> Value {
    if let Some(scalar) = attributes.get("") {
        if attributes.len() == 1 {
            return scalar.clone();
        }
    }

    let mut root = Node::default();
    for (path, value) in attributes {
        if path.is_empty() {
            continue;
        }
        let mut node = &mut root;
        for segment in path.split('.') {
            node = node
                .children
                .entry(segment.to_string())
                .or_default();
        }
        node.value = Some(value.clone());
    }
    root.into_value()
}

#[derive(Default)]
struct Node {
    value: Option<Value>,
    children: std::collections::BTreeMap<String, Node>,
}

impl Node {
    fn into_value(self) -> Value {
        if self.children.is_empty() {
            return self.value.unwrap_or(Value::Null);
        }

        let all_numeric = self.children.keys().all(|k| k.parse::<usize>().is_ok());
        if all_numeric {
            let mut entries: Vec<(usize, Node)> = self
                .children
                .into_iter()
                .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
                .collect();
            entries.sort_by_key(|(i, _)| *i);
            return Value::Array(entries.into_iter().map(|(_, v)| v.into_value()).collect());
        }

        Value::Object(
            self.children
                .into_iter()
                .map(|(k, v)| (k, v.into_value()))
                .collect(),
        )
    }
}
