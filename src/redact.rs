//! Secret redaction for logged payloads.
//!
//! Any JSON field whose name matches the sensitive pattern is replaced
//! before the value reaches a log line. Upstream keys and client tokens
//! must never appear in logs or client-visible errors.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

const MASK: &str = "[redacted]";

lazy_static! {
    static ref SENSITIVE_KEY: Regex =
        Regex::new(r"(?i)(api[_-]?key|authorization|token|password|secret)").unwrap();
}

pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Deep-copy `value` with every sensitive field masked.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(key.clone(), redact_value(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}
