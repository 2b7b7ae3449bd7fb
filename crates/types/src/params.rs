//! Canonical form of opaque input parameters.
//!
//! Two payloads that differ only in object key order produce the same
//! canonical string and therefore the same hash. Arrays keep their order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex-encoded SHA-256 of [`canonical_json`]
pub fn params_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
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
        Value::String(s) => write_string(s, out),
        // null, bool and numbers already have a single textual form
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"a": {"x": "s", "y": [1, 2]}, "b": 1}"#).unwrap();

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"ids": [1, 2, 3]});
        let b = json!({"ids": [3, 2, 1]});
        assert_ne!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn test_canonical_text() {
        let v = json!({"z": null, "a": [true, {"d": 1.5, "c": "q\"uote"}]});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[true,{"c":"q\"uote","d":1.5}],"z":null}"#
        );
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = params_hash(&json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
