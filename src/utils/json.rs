use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::error::GatewayError;

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Parses model output that is supposed to be a single JSON object.
pub fn parse_object(content: &str) -> Result<Value, GatewayError> {
    let clean = strip_code_blocks(content);
    if clean.is_empty() {
        return Err(GatewayError::Empty);
    }
    let value: Value = serde_json::from_str(&clean)
        .map_err(|e| GatewayError::InvalidJson(format!("{}: {}", e, clean)))?;
    if !value.is_object() {
        return Err(GatewayError::NotAnObject);
    }
    Ok(value)
}

pub fn required_str(value: &Value, key: &str) -> Result<String, GatewayError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::missing(key))
}

/// Deserializes the whole object into `T`, reporting a shape error instead of a panic.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|e| GatewayError::Shape(e.to_string()))
}

/// Keeps only the array entries of `key` that decode as `T`. A missing key is an empty list.
pub fn lenient_list<T: DeserializeOwned>(value: &Value, key: &str) -> Vec<T> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Builds `{key: value, ...}` for prompts that ask the model to translate an object in place.
pub fn object_of(pairs: &[(&str, &str)]) -> Value {
    let map: Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    Value::Object(map)
}
