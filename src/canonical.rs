//! Canonical JSON encoding.
//!
//! Every hash and signature in the protocol covers the canonical form of
//! some JSON value: keys in lexicographic order, UTF-8, no insignificant
//! whitespace, numbers as integers where representable. One encoder is
//! used everywhere rather than whatever a platform's default encoder
//! happens to emit, so encode → decode → re-encode is a fixed point.

use serde::Serialize;
use serde_json::Value;

use crate::error::ConsensusError;

/// Canonical encoding of any serializable value.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ConsensusError> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_value_string(&value).into_bytes())
}

/// Canonical encoding of an already-materialized JSON value.
pub fn canonical_value_bytes(value: &Value) -> Vec<u8> {
    canonical_value_string(value).into_bytes()
}

pub fn canonical_value_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                // Key came from the map, entry must exist.
                if let Some(v) = map.get(*key) {
                    write_value(out, v);
                }
            }
            out.push('}');
        }
    }
}

// JSON string escaping: the two mandatory escapes plus \u00XX for control
// characters, with the conventional short forms. Non-ASCII stays as UTF-8.
fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
