//! Prefix aggregation
//!
//! Flattened dotted keys (`0.role`, `0.content`, `1.role`, ...) are folded
//! back into a JSON tree. Numeric segments turn their parent into an array.

use serde_json::{Map, Value as JsonValue};

use super::table::Wrap;
use super::value::AttrValue;

const ARRAY_MARKER: &str = "__array__";

/// Build a nested value from `(path, value)` entries, paths relative to the prefix
pub fn aggregate(entries: &[(&str, &AttrValue)]) -> JsonValue {
    let mut sorted: Vec<(&str, &AttrValue)> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    // An explicit value at a higher level shadows everything beneath it.
    let kept: Vec<(&str, &AttrValue)> = sorted
        .iter()
        .filter(|(path, _)| {
            !sorted.iter().any(|(other, _)| {
                other.len() < path.len()
                    && path.starts_with(other)
                    && path.as_bytes()[other.len()] == b'.'
            })
        })
        .copied()
        .collect();

    let mut root = JsonValue::Object(Map::new());
    for (path, value) in kept {
        insert_path(&mut root, path, value.to_json());
    }
    fold_arrays(root)
}

fn insert_path(root: &mut JsonValue, path: &str, leaf: JsonValue) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut node = root;
    for (i, segment) in segments.iter().enumerate() {
        let JsonValue::Object(map) = node else {
            tracing::debug!(path, "Aggregation path runs through a scalar, skipping");
            return;
        };
        if is_index(segment) {
            map.insert(ARRAY_MARKER.to_string(), JsonValue::Bool(true));
        }
        if i + 1 == segments.len() {
            map.insert((*segment).to_string(), leaf);
            return;
        }
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn fold_arrays(value: JsonValue) -> JsonValue {
    let JsonValue::Object(map) = value else {
        return value;
    };
    if map.contains_key(ARRAY_MARKER) {
        let mut items: Vec<(u64, JsonValue)> = map
            .into_iter()
            .filter_map(|(k, v)| Some((k.parse::<u64>().ok()?, fold_arrays(v))))
            .collect();
        items.sort_by_key(|(i, _)| *i);
        return JsonValue::Array(items.into_iter().map(|(_, v)| v).collect());
    }
    JsonValue::Object(
        map.into_iter()
            .map(|(k, v)| (k, fold_arrays(v)))
            .collect(),
    )
}

/// Apply wrap steps in order
pub fn apply_wraps(mut value: JsonValue, wraps: &[Wrap]) -> JsonValue {
    for wrap in wraps {
        value = match *wrap {
            Wrap::Under(key) => wrap_under(key, value),
            Wrap::EachUnder(key) => match value {
                JsonValue::Array(items) => {
                    JsonValue::Array(items.into_iter().map(|v| wrap_under(key, v)).collect())
                }
                other => wrap_under(key, other),
            },
        };
    }
    value
}

fn wrap_under(key: &str, value: JsonValue) -> JsonValue {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    JsonValue::Object(map)
}
