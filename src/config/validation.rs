//! Primitive parsers for the flat key/value configuration store.
//!
//! The legacy store keeps every value as free-form JSON (usually strings),
//! so each accessor tolerates both native and string-encoded scalars.

use serde_json::{Map, Value};

/// Parse the legacy boolean spellings: `true/false/on/off/yes/no/1/0`.
///
/// Unrecognized input returns `None` so callers can keep their default.
pub fn parse_flexible_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Boolean config key with flexible spellings.
pub fn kv_bool(map: &Map<String, Value>, key: &str, default: bool) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => parse_flexible_bool(s).unwrap_or(default),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
        _ => default,
    }
}

/// Unsigned integer config key, accepting numeric or string values.
pub fn kv_u32(map: &Map<String, Value>, key: &str, default: u32) -> u32 {
    kv_u64(map, key, default as u64).try_into().unwrap_or(default)
}

/// Unsigned integer config key, accepting numeric or string values.
pub fn kv_u64(map: &Map<String, Value>, key: &str, default: u64) -> u64 {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Floating-point config key, accepting numeric or string values.
pub fn kv_f64(map: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// String config key; non-string scalars are stringified.
pub fn kv_string(map: &Map<String, Value>, key: &str, default: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => default.to_string(),
    }
}
