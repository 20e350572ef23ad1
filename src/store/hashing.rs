//! Canonical JSON and content hashing
//!
//! Artifact ids and idempotency keys are SHA-256 digests over canonical JSON:
//! object keys sorted, no insignificant whitespace. Two values that compare
//! equal always hash to the same id regardless of key insertion order.

use crate::model::{ArtifactId, StageKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Serialise a JSON value canonically
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", quote(k), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

fn quote(s: &str) -> String {
    // Serialising a str cannot fail
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s.escape_default()))
}

/// Hex SHA-256 of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content address of a JSON value
pub fn content_id(content: &Value) -> ArtifactId {
    ArtifactId::from_hex(sha256_hex(to_canonical_json(content).as_bytes()))
}

/// Deterministic idempotency key for one task
///
/// Scoped to the run: identical documents in two runs execute independently.
pub fn idempotency_key(run_id: Uuid, stage: &StageKey, shard: u32, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(stage.to_string().as_bytes());
    hasher.update(shard.to_be_bytes());
    hasher.update(to_canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageKind;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_primitives() {
        assert_eq!(to_canonical_json(&json!(null)), "null");
        assert_eq!(to_canonical_json(&json!(true)), "true");
        assert_eq!(to_canonical_json(&json!(123)), "123");
        assert_eq!(to_canonical_json(&json!("text")), "\"text\"");
    }

    #[test]
    fn test_object_sorted_keys() {
        let val = json!({ "b": 2, "a": 1 });
        assert_eq!(to_canonical_json(&val), "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn test_nested() {
        let val = json!({ "z": [ { "y": "yes" }, null ], "a": { "x": 10 } });
        assert_eq!(
            to_canonical_json(&val),
            "{\"a\":{\"x\":10},\"z\":[{\"y\":\"yes\"},null]}"
        );
    }

    #[test]
    fn test_escaping() {
        let val = json!({ "q": "say \"hi\"\n" });
        assert_eq!(to_canonical_json(&val), "{\"q\":\"say \\\"hi\\\"\\n\"}");
    }

    #[test]
    fn test_content_id_shape() {
        let id = content_id(&json!({"summary": "ok"}));
        assert!(id.is_well_formed());
    }

    #[test]
    fn test_idempotency_key_depends_on_every_part() {
        let run = Uuid::new_v4();
        let stage = StageKey::first(StageKind::Analyse);
        let payload = json!({"document": "a"});
        let base = idempotency_key(run, &stage, 0, &payload);

        assert_eq!(base, idempotency_key(run, &stage, 0, &payload));
        assert_ne!(base, idempotency_key(Uuid::new_v4(), &stage, 0, &payload));
        assert_ne!(base, idempotency_key(run, &stage, 1, &payload));
        assert_ne!(
            base,
            idempotency_key(run, &StageKey::first(StageKind::Synthesis), 0, &payload)
        );
        assert_ne!(base, idempotency_key(run, &stage, 0, &json!({"document": "b"})));
    }

    proptest! {
        #[test]
        fn prop_content_id_ignores_key_order(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let forward: serde_json::Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: serde_json::Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();

            prop_assert_eq!(
                content_id(&Value::Object(forward)),
                content_id(&Value::Object(reversed))
            );
        }
    }
}
