//! Canonical JSON rendering of artifacts
//!
//! Output has recursively sorted object keys and no whitespace, so two
//! exports of the same artifact are byte-identical and diff cleanly.

use crate::artifact::Artifact;
use crate::errors::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct ExportDocument<'a> {
    fingerprint: String,
    artifact: &'a Artifact,
}

/// Serialize a value to canonical JSON (sorted keys, no whitespace)
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let json_value = serde_json::to_value(value)?;
    let canonical = canonicalize_value(&json_value);
    Ok(serde_json::to_string(&canonical)?)
}

/// Sort all object keys recursively
fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

/// Whole artifact plus its fingerprint as canonical JSON.
pub fn export_canonical_json(artifact: &Artifact) -> Result<String> {
    to_canonical_json(&ExportDocument {
        fingerprint: artifact.fingerprint()?,
        artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Provenance;
    use crate::schema::FeatureSchema;
    use crate::tree::{TreeNode, TreeNodeTable};
    use serde_json::json;

    #[derive(Serialize)]
    struct Unsorted {
        zebra: u8,
        apple: u8,
        nested: BTreeMap<String, u8>,
    }

    #[test]
    fn test_keys_sorted_without_whitespace() {
        let json = to_canonical_json(&Unsorted {
            zebra: 1,
            apple: 2,
            nested: BTreeMap::from([("b".to_string(), 1), ("a".to_string(), 2)]),
        })
        .unwrap();
        assert_eq!(json, r#"{"apple":2,"nested":{"a":2,"b":1},"zebra":1}"#);
    }

    #[test]
    fn test_construction_order_irrelevant() {
        let a = json!({"x": 1, "y": [1, 2]});
        let b = json!({"y": [1, 2], "x": 1});
        assert_eq!(to_canonical_json(&a).unwrap(), to_canonical_json(&b).unwrap());
    }

    #[test]
    fn test_export_artifact() {
        let table = TreeNodeTable::from_rows(
            vec![TreeNode::internal(0, 1.5, 1, 2), TreeNode::leaf(), TreeNode::leaf()],
            vec![vec![2.0, 2.0], vec![2.0, 0.0], vec![0.0, 2.0]],
            1,
        )
        .unwrap();
        let artifact = Artifact::new(
            FeatureSchema::new(["age"]).unwrap(),
            table,
            vec!["healthy".into(), "sick".into()],
            Provenance::now(),
        )
        .unwrap();

        let exported = export_canonical_json(&artifact).unwrap();
        assert_eq!(exported, export_canonical_json(&artifact).unwrap());

        let doc: Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(doc["fingerprint"], json!(artifact.fingerprint().unwrap()));
        assert_eq!(doc["artifact"]["labels"], json!(["healthy", "sick"]));
        assert_eq!(doc["artifact"]["schema"], json!(["age"]));
        assert_eq!(doc["artifact"]["table"]["nodes"][0]["threshold"], json!(1.5));
    }
}
