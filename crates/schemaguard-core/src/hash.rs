//! Content hashing for plans and audit records.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `text`.
#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuilds `value` with every object's keys in sorted order.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys, stable across key order of the input.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Hash of the SSOT script text, byte for byte.
#[must_use]
pub fn ssot_hash(ssot: &str) -> String {
    sha256_hex(ssot)
}

/// Hash of an introspection document in canonical form.
#[must_use]
pub fn snapshot_hash(snapshot: &Value) -> String {
    sha256_hex(&canonical_json(snapshot))
}

/// Session advisory lock key serializing applies for one tenant: the
/// first 8 bytes of `SHA-256("schemaguard:apply:" + tenant_id)`, big endian.
#[must_use]
pub fn apply_lock_key(tenant_id: &str) -> i64 {
    let digest = Sha256::digest(format!("schemaguard:apply:{tenant_id}").as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [ {"y": 1, "x": 2} ], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"z":[{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_snapshot_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"tables":[],"indexes":[{"name":"i","table":"t"}]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"indexes":[{"table":"t","name":"i"}],"tables":[]}"#).unwrap();
        assert_eq!(snapshot_hash(&a), snapshot_hash(&b));
    }

    #[test]
    fn test_apply_lock_key_stable_per_tenant() {
        assert_eq!(apply_lock_key("tenant-a"), apply_lock_key("tenant-a"));
        assert_ne!(apply_lock_key("tenant-a"), apply_lock_key("tenant-b"));
    }

    #[test]
    fn test_snapshot_hash_sensitive_to_array_order() {
        let a = json!({"tables": [{"name": "a"}, {"name": "b"}]});
        let b = json!({"tables": [{"name": "b"}, {"name": "a"}]});
        assert_ne!(snapshot_hash(&a), snapshot_hash(&b));
    }
}
