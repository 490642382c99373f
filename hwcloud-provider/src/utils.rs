//! Utility functions for JSON lookups and value conversion

use std::collections::HashMap;

use hwcloud_core::resource::Value;
use serde_json::json;

/// Look up a dotted path such as `entities.sub_jobs[0].entities.server_id`
pub fn path_search<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |current, segment| {
        let (key, index) = match segment.split_once('[') {
            Some((key, rest)) => (key, Some(rest.strip_suffix(']')?.parse::<usize>().ok()?)),
            None => (segment, None),
        };
        let current = if key.is_empty() {
            current
        } else {
            current.get(key)?
        };
        match index {
            Some(i) => current.get(i),
            None => Some(current),
        }
    })
}

/// String at a dotted path, if present and a string
pub fn path_str<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a str> {
    path_search(value, path).and_then(serde_json::Value::as_str)
}

/// Convert JSON value to DSL Value
pub fn json_to_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::String(s) => Some(Value::String(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else {
                n.as_f64().map(|f| Value::Int(f as i64))
            }
        }
        serde_json::Value::Array(arr) => Some(Value::List(
            arr.iter().filter_map(json_to_value).collect(),
        )),
        serde_json::Value::Object(map) => Some(Value::Map(
            map.iter()
                .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
        serde_json::Value::Null => None,
    }
}

/// Convert DSL Value to JSON value
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::String(s) => json!(s),
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// JSON object built from attributes, leaving out the listed keys
pub fn attributes_to_json(attributes: &HashMap<String, Value>, skip: &[&str]) -> serde_json::Value {
    serde_json::Value::Object(
        attributes
            .iter()
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}

/// Attributes read back from a JSON object
pub fn json_to_attributes(object: &serde_json::Value) -> HashMap<String, Value> {
    match object {
        serde_json::Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
            .collect(),
        _ => HashMap::new(),
    }
}
