//! End-to-end migration tests: legacy file on disk to a loadable artifact.

use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use vetree_core::format::{self, LEGACY_FORMAT_VERSION};
use vetree_core::legacy::LegacyMetadataV1;
use vetree_core::{
    load_artifact, migrate, predict, LegacyLayout, MigrationConfig, MissingDirection,
    TreeNode, TypeResolution, VetreeError,
};

const FEATURES: [&str; 6] = [
    "age",
    "body_temperature",
    "animal_cow",
    "animal_goat",
    "fever",
    "cough",
];
const LABELS: [&str; 3] = ["healthy", "east_coast_fever", "pneumonia"];

// body_temperature <= 39.5 ? (cough <= 0.5 ? healthy : pneumonia) : east_coast_fever
fn tree_component() -> Value {
    json!({
        "__type__": "sklearn.tree._tree.Tree",
        "node_count": 5,
        "max_depth": 2,
        "children_left": [1, 3, -1, -1, -1],
        "children_right": [2, 4, -1, -1, -1],
        "feature": [1, 5, -2, -2, -2],
        "threshold": [39.5, 0.5, -2.0, -2.0, -2.0],
        "impurity": [0.61, 0.42, 0.38, 0.14, 0.24],
        "n_node_samples": [32, 20, 12, 13, 7],
        "weighted_n_node_samples": [32.0, 20.0, 12.0, 13.0, 7.0],
        "value": [
            [[14.0, 10.0, 8.0]],
            [[13.0, 1.0, 6.0]],
            [[1.0, 9.0, 2.0]],
            [[12.0, 1.0, 0.0]],
            [[1.0, 0.0, 6.0]]
        ]
    })
}

fn bundle(model_type: &str, tree: Value) -> Value {
    json!({
        "model": {
            "__type__": model_type,
            "n_features_in_": 6,
            "n_classes_": 3,
            "n_outputs_": 1,
            "tree_": tree
        },
        "features": FEATURES,
        "label_encoder_classes": LABELS
    })
}

fn write_json(dir: &TempDir, name: &str, value: &Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
    path
}

fn assert_reference_predictions(path: &Path) {
    let artifact = load_artifact(path).unwrap();

    let p = predict(
        &artifact,
        &json!({"animal_type": "cow", "body_temperature": 40.1, "symptoms": ["Fever"]}),
    )
    .unwrap();
    assert_eq!(p.label, "east_coast_fever");
    assert!((p.confidence - 0.75).abs() < 1e-12);

    let p = predict(&artifact, &json!({"body_temperature": 38.6, "symptoms": ["cough"]})).unwrap();
    assert_eq!(p.label, "pneumonia");
    assert!((p.confidence - 6.0 / 7.0).abs() < 1e-12);

    let p = predict(&artifact, &json!({})).unwrap();
    assert_eq!(p.label, "healthy");
    assert!((p.confidence - 12.0 / 13.0).abs() < 1e-12);
}

#[test]
fn test_migrate_parallel_arrays() {
    let dir = TempDir::new().unwrap();
    let legacy = write_json(
        &dir,
        "legacy.json",
        &bundle("sklearn.tree._classes.DecisionTreeClassifier", tree_component()),
    );
    let target = dir.path().join("models").join("decision_tree.vtra");

    let artifact = migrate(&legacy, &target, &MigrationConfig::default()).unwrap();
    assert_eq!(artifact.schema().names(), FEATURES);
    assert_eq!(artifact.labels(), LABELS);
    assert_eq!(artifact.table().max_depth(), 2);

    let nodes = artifact.table().nodes();
    assert!(nodes[2..].iter().all(TreeNode::is_leaf));
    assert!(nodes
        .iter()
        .all(|n| n.missing_direction == MissingDirection::GoRight));
    assert_eq!(nodes[3].sample_count, 13);
    assert_eq!(nodes[0].impurity, 0.61);

    let record = artifact.provenance().migrated_from.clone().unwrap();
    assert_eq!(record.layout, LegacyLayout::ParallelArrays.to_string());

    assert_eq!(load_artifact(&target).unwrap(), artifact);
    assert_reference_predictions(&target);
}

#[test]
fn test_migrate_node_records() {
    let component = tree_component();
    let mut records = Vec::new();
    for i in 0..5 {
        records.push(json!({
            "left_child": component["children_left"][i],
            "right_child": component["children_right"][i],
            "feature": component["feature"][i],
            "threshold": component["threshold"][i],
            "impurity": component["impurity"][i],
            "n_node_samples": component["n_node_samples"][i],
            "weighted_n_node_samples": component["weighted_n_node_samples"][i],
        }));
    }
    let tree = json!({
        "__type__": "sklearn.tree._tree.Tree",
        "nodes": records,
        "value": component["value"],
    });

    let dir = TempDir::new().unwrap();
    let legacy = write_json(&dir, "legacy.json", &bundle("DecisionTreeClassifier", tree));
    let target = dir.path().join("new.vtra");

    let artifact = migrate(&legacy, &target, &MigrationConfig::default()).unwrap();
    assert_eq!(
        artifact.provenance().migrated_from.as_ref().unwrap().layout,
        "node-records"
    );
    assert_reference_predictions(&target);
}

#[test]
fn test_migrate_binary_v1() {
    let nodes = vec![
        TreeNode::internal(1, 39.5, 1, 2).with_stats(0.61, 32, 32.0),
        TreeNode::internal(5, 0.5, 3, 4).with_stats(0.42, 20, 20.0),
        TreeNode::leaf().with_stats(0.38, 12, 12.0),
        TreeNode::leaf().with_stats(0.14, 13, 13.0),
        TreeNode::leaf().with_stats(0.24, 7, 7.0),
    ];
    let values = [
        14.0, 10.0, 8.0, 13.0, 1.0, 6.0, 1.0, 9.0, 2.0, 12.0, 1.0, 0.0, 1.0, 0.0, 6.0,
    ];
    let metadata = bincode::serialize(&LegacyMetadataV1 {
        features: FEATURES.iter().map(|s| s.to_string()).collect(),
        labels: LABELS.iter().map(|s| s.to_string()).collect(),
    })
    .unwrap();
    let bytes =
        format::write_sections(LEGACY_FORMAT_VERSION, &nodes, &values, 6, 3, &metadata).unwrap();

    let dir = TempDir::new().unwrap();
    let legacy = dir.path().join("legacy.vtra");
    fs::write(&legacy, bytes).unwrap();

    // Serving refuses the old layout outright.
    assert!(load_artifact(&legacy).unwrap_err().is_corruption());

    let target = dir.path().join("current.vtra");
    let artifact = migrate(&legacy, &target, &MigrationConfig::default()).unwrap();
    assert_eq!(artifact.format_version(), format::CURRENT_FORMAT_VERSION);
    assert_eq!(
        artifact.provenance().migrated_from.as_ref().unwrap().layout,
        "binary-v1"
    );
    assert_reference_predictions(&target);
}

#[test]
fn test_unknown_type_strict_then_permissive() {
    let dir = TempDir::new().unwrap();
    let legacy = write_json(
        &dir,
        "legacy.json",
        &bundle("farmml.models.HerdClassifier", tree_component()),
    );
    let target = dir.path().join("new.vtra");

    let err = migrate(&legacy, &target, &MigrationConfig::default()).unwrap_err();
    assert!(err.is_corruption());
    assert!(!target.exists());

    let permissive = MigrationConfig {
        type_resolution: TypeResolution::Permissive,
        ..MigrationConfig::default()
    };
    let artifact = migrate(&legacy, &target, &permissive).unwrap();
    assert_eq!(
        artifact
            .provenance()
            .migrated_from
            .as_ref()
            .unwrap()
            .legacy_type
            .as_deref(),
        Some("farmml.models.HerdClassifier")
    );
    assert_reference_predictions(&target);
}

#[test]
fn test_mismatched_arrays_write_nothing() {
    let mut tree = tree_component();
    tree["threshold"] = json!([39.5, 0.5, -2.0, -2.0]);
    tree.as_object_mut().unwrap().remove("node_count");

    let dir = TempDir::new().unwrap();
    let legacy = write_json(&dir, "legacy.json", &bundle("DecisionTreeClassifier", tree));
    let target = dir.path().join("new.vtra");

    let err = migrate(&legacy, &target, &MigrationConfig::default()).unwrap_err();
    assert!(err.is_corruption());
    assert!(!target.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_cycle_rejected_and_existing_artifact_untouched() {
    let dir = TempDir::new().unwrap();
    let good = write_json(
        &dir,
        "good.json",
        &bundle("DecisionTreeClassifier", tree_component()),
    );
    let target = dir.path().join("model.vtra");
    migrate(&good, &target, &MigrationConfig::default()).unwrap();
    let before = fs::read(&target).unwrap();

    let mut tree = tree_component();
    tree["children_left"] = json!([0, 3, -1, -1, -1]);
    let bad = write_json(&dir, "bad.json", &bundle("DecisionTreeClassifier", tree));

    assert!(migrate(&bad, &target, &MigrationConfig::default())
        .unwrap_err()
        .is_corruption());
    assert_eq!(fs::read(&target).unwrap(), before);
}

#[test]
fn test_existing_target_is_backed_up() {
    let dir = TempDir::new().unwrap();
    let legacy = write_json(
        &dir,
        "legacy.json",
        &bundle("DecisionTreeClassifier", tree_component()),
    );
    let target = dir.path().join("model.vtra");
    fs::write(&target, b"previous artifact").unwrap();

    let config = MigrationConfig {
        backup_suffix: "old".into(),
        ..MigrationConfig::default()
    };
    migrate(&legacy, &target, &config).unwrap();

    let backups: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("model.vtra.") && name.ends_with(".old"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        fs::read(dir.path().join(&backups[0])).unwrap(),
        b"previous artifact"
    );
    assert_reference_predictions(&target);
}

#[test]
fn test_bare_model_migrates_without_schema() {
    let root = json!({
        "__type__": "sklearn.tree._classes.DecisionTreeClassifier",
        "n_features_in_": 6,
        "tree_": tree_component()
    });
    let dir = TempDir::new().unwrap();
    let legacy = write_json(&dir, "bare.json", &root);
    let target = dir.path().join("bare.vtra");

    let artifact = migrate(&legacy, &target, &MigrationConfig::default()).unwrap();
    assert!(artifact.schema().is_empty());
    assert!(artifact.labels().is_empty());

    let err = predict(&artifact, &json!({"age": 2})).unwrap_err();
    assert!(matches!(err, VetreeError::SchemaMismatch { expected: 6, actual: 0 }));

    let p = artifact.predict_vector(&[]).unwrap_err();
    assert!(matches!(p, VetreeError::SchemaMismatch { .. }));
}

#[test]
fn test_missing_legacy_file() {
    let dir = TempDir::new().unwrap();
    let err = migrate(
        dir.path().join("nope.json"),
        dir.path().join("new.vtra"),
        &MigrationConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, VetreeError::ArtifactNotFound(_)));
}

#[test]
fn test_tampered_artifact_fails_checksum() {
    let dir = TempDir::new().unwrap();
    let legacy = write_json(
        &dir,
        "legacy.json",
        &bundle("DecisionTreeClassifier", tree_component()),
    );
    let target = dir.path().join("model.vtra");
    migrate(&legacy, &target, &MigrationConfig::default()).unwrap();

    let mut bytes = fs::read(&target).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&target, bytes).unwrap();

    let err = load_artifact(&target).unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("checksum"));
}
