//! Canonical JSON serialization and content digests.
//!
//! The canonical form is compact JSON with object keys sorted at every
//! depth, so two values that differ only in key insertion order serialize
//! to the same bytes and hash to the same digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes `value` to its canonical JSON text.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Byte length of the canonical form of `value`.
pub fn canonical_len(value: &Value) -> usize {
    canonicalize(value).len()
}

/// Lowercase hex SHA-256 of the canonical form of `value`.
pub fn digest(value: &Value) -> String {
    let hash = Sha256::digest(canonicalize(value).as_bytes());
    hex::encode(hash)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

// Scalars never fail to serialize; the fallback only guards the API.
fn write_scalar(value: &Value, out: &mut String) {
    match serde_json::to_string(value) {
        Ok(text) => out.push_str(&text),
        Err(_) => out.push_str("null"),
    }
}
