//! Reader for legacy tree artifacts.
//!
//! Legacy inputs come in a closed set of layouts: the version 1 binary
//! format (node records without a missing-direction column) and a JSON
//! object graph exported by the training pipeline, whose tree
//! component stores either parallel per-field arrays or per-node records.
//! Each layout is matched structurally; anything that does not match exactly
//! one of them is reported as corrupt.
//!
//! Objects in the graph may carry a `__type__` tag naming the class they were
//! serialized from. Under [`TypeResolution::Strict`] an unrecognised tag is an
//! error; under [`TypeResolution::Permissive`] it is logged and ignored so the
//! structure alone decides.

use crate::config::TypeResolution;
use crate::errors::{Result, VetreeError};
use crate::format::{self, LEGACY_FORMAT_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

/// Key holding an object's serialized type name.
pub const TYPE_TAG: &str = "__type__";

/// Fully-qualified names the reader knows for the classifier object.
pub const KNOWN_CLASSIFIER_TYPES: &[&str] = &[
    "sklearn.tree._classes.DecisionTreeClassifier",
    "sklearn.tree.tree.DecisionTreeClassifier",
];

/// Fully-qualified names the reader knows for the tree component.
pub const KNOWN_TREE_TYPES: &[&str] = &["sklearn.tree._tree.Tree"];

/// Structural layout a legacy input was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegacyLayout {
    /// Binary format version 1
    BinaryV1,
    /// JSON graph, tree stored as one array per field
    ParallelArrays,
    /// JSON graph, tree stored as one record per node
    NodeRecords,
}

impl fmt::Display for LegacyLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegacyLayout::BinaryV1 => "binary-v1",
            LegacyLayout::ParallelArrays => "parallel-arrays",
            LegacyLayout::NodeRecords => "node-records",
        };
        f.write_str(name)
    }
}

/// Tree fields as stored by the legacy writer, one entry per node.
/// Lengths are not cross-checked here; the migrator does that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub impurity: Vec<f64>,
    pub n_node_samples: Vec<i64>,
    pub weighted_n_node_samples: Vec<f64>,
    /// Only present when the records carried the flag column
    pub missing_go_to_left: Option<Vec<u8>>,
    /// Per-node class weights
    pub value: Vec<Vec<f64>>,
    pub node_count: Option<usize>,
    pub max_depth: Option<usize>,
    pub n_features: Option<usize>,
    pub n_classes: Option<usize>,
}

/// Everything recovered from a legacy input.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyArtifact {
    pub layout: LegacyLayout,
    /// Type tag the model object claimed
    pub model_type: Option<String>,
    pub features: Vec<String>,
    pub labels: Vec<String>,
    pub tree: LegacyTree,
}

/// Metadata section of a version 1 binary file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyMetadataV1 {
    pub features: Vec<String>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownType {
    Classifier,
    Tree,
}

impl KnownType {
    fn recognises(self, tag: &str) -> bool {
        let class_name = tag.rsplit('.').next().unwrap_or(tag);
        match self {
            KnownType::Classifier => {
                KNOWN_CLASSIFIER_TYPES.contains(&tag) || class_name.contains("DecisionTree")
            }
            KnownType::Tree => KNOWN_TREE_TYPES.contains(&tag) || class_name == "Tree",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            KnownType::Classifier => "decision-tree classifier",
            KnownType::Tree => "tree component",
        }
    }
}

/// Parse a legacy input of any supported layout.
pub fn read_legacy(bytes: &[u8], policy: TypeResolution) -> Result<LegacyArtifact> {
    if format::has_magic(bytes) {
        return read_binary_v1(bytes);
    }

    let root: Value = serde_json::from_slice(bytes).map_err(|e| {
        VetreeError::corrupt(format!(
            "input is neither a binary artifact nor a JSON object graph: {e}"
        ))
    })?;
    read_object_graph(&root, policy)
}

fn read_binary_v1(bytes: &[u8]) -> Result<LegacyArtifact> {
    let raw = format::read_sections(bytes)?;
    if raw.header.version != LEGACY_FORMAT_VERSION {
        return Err(VetreeError::corrupt(format!(
            "binary artifact is format version {}, not a legacy layout",
            raw.header.version
        )));
    }

    let metadata: LegacyMetadataV1 = bincode::deserialize(raw.metadata)
        .map_err(|e| VetreeError::corrupt(format!("legacy metadata unreadable: {e}")))?;

    let n_classes = usize::try_from(raw.header.n_classes)
        .map_err(|_| VetreeError::corrupt("class count too large"))?;
    let n_features = usize::try_from(raw.header.n_features)
        .map_err(|_| VetreeError::corrupt("feature count too large"))?;

    let mut tree = LegacyTree {
        node_count: Some(raw.nodes.len()),
        n_features: Some(n_features),
        n_classes: Some(n_classes),
        ..LegacyTree::default()
    };
    for node in &raw.nodes {
        tree.children_left.push(node.left_child);
        tree.children_right.push(node.right_child);
        tree.feature.push(node.split_feature);
        tree.threshold.push(node.threshold);
        tree.impurity.push(node.impurity);
        tree.n_node_samples.push(node.sample_count);
        tree.weighted_n_node_samples.push(node.weighted_sample_count);
    }
    tree.value = if n_classes == 0 {
        vec![Vec::new(); raw.nodes.len()]
    } else {
        raw.values.chunks(n_classes).map(<[f64]>::to_vec).collect()
    };

    debug!(nodes = raw.nodes.len(), "read legacy binary v1 artifact");
    Ok(LegacyArtifact {
        layout: LegacyLayout::BinaryV1,
        model_type: None,
        features: metadata.features,
        labels: metadata.labels,
        tree,
    })
}

/// Interpret a decoded JSON object graph.
pub fn read_object_graph(root: &Value, policy: TypeResolution) -> Result<LegacyArtifact> {
    let (model, features, labels) = match root {
        Value::Object(map) if map.contains_key("model") => {
            let labels = map
                .get("label_encoder_classes")
                .or_else(|| map.get("labels"));
            (
                &map["model"],
                string_list(map.get("features"), "features")?,
                string_list(labels, "label_encoder_classes")?,
            )
        }
        other => (other, Vec::new(), Vec::new()),
    };

    let model = model
        .as_object()
        .ok_or_else(|| VetreeError::corrupt("model is not an object"))?;
    let model_type = resolve_type(model, KnownType::Classifier, policy)?;
    let labels = if labels.is_empty() {
        string_list(model.get("classes_"), "classes_")?
    } else {
        labels
    };

    let tree_obj = model
        .get("tree_")
        .or_else(|| model.get("tree"))
        .and_then(Value::as_object)
        .ok_or_else(|| VetreeError::corrupt("model has no tree component ('tree_')"))?;
    resolve_type(tree_obj, KnownType::Tree, policy)?;

    if let Some(outputs) = opt_usize(model, "n_outputs_")? {
        if outputs != 1 {
            return Err(VetreeError::corrupt(format!(
                "multi-output trees are not supported (n_outputs_ = {outputs})"
            )));
        }
    }

    let layout = match (tree_obj.contains_key("children_left"), tree_obj.contains_key("nodes")) {
        (true, false) => LegacyLayout::ParallelArrays,
        (false, true) => LegacyLayout::NodeRecords,
        (true, true) => {
            return Err(VetreeError::corrupt(
                "tree component matches both parallel-array and node-record layouts",
            ))
        }
        (false, false) => {
            return Err(VetreeError::corrupt(
                "tree component matches no known legacy layout",
            ))
        }
    };
    debug!(%layout, "legacy tree layout detected");

    let mut tree = match layout {
        LegacyLayout::ParallelArrays => read_parallel_arrays(tree_obj)?,
        _ => read_node_records(tree_obj)?,
    };
    tree.value = read_value_table(tree_obj)?;
    tree.node_count = opt_usize(tree_obj, "node_count")?;
    tree.max_depth = opt_usize(tree_obj, "max_depth")?;
    tree.n_features = match opt_usize(model, "n_features_in_")? {
        Some(n) => Some(n),
        None => opt_usize(tree_obj, "n_features")?,
    };
    tree.n_classes = match opt_usize(model, "n_classes_")? {
        Some(n) => Some(n),
        None => opt_usize(tree_obj, "n_classes")?,
    };

    Ok(LegacyArtifact {
        layout,
        model_type,
        features,
        labels,
        tree,
    })
}

/// Check an object's type tag against `kind`. Returns the tag, if any.
fn resolve_type(
    obj: &Map<String, Value>,
    kind: KnownType,
    policy: TypeResolution,
) -> Result<Option<String>> {
    let tag = match obj.get(TYPE_TAG) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(tag)) => tag.clone(),
        Some(other) => {
            return Err(VetreeError::corrupt(format!(
                "{TYPE_TAG} must be a string, got {other}"
            )))
        }
    };

    if kind.recognises(&tag) {
        return Ok(Some(tag));
    }

    match policy {
        TypeResolution::Strict => Err(VetreeError::corrupt(format!(
            "legacy {} has unrecognised type '{tag}'; permissive type resolution can coerce it",
            kind.describe()
        ))),
        TypeResolution::Permissive => {
            warn!(
                claimed = %tag,
                expected = kind.describe(),
                "unrecognised legacy type, coercing by structure"
            );
            Ok(Some(tag))
        }
    }
}

fn read_parallel_arrays(obj: &Map<String, Value>) -> Result<LegacyTree> {
    Ok(LegacyTree {
        children_left: int_array(obj, "children_left")?,
        children_right: int_array(obj, "children_right")?,
        feature: int_array(obj, "feature")?,
        threshold: float_array(obj, "threshold")?,
        impurity: float_array(obj, "impurity")?,
        n_node_samples: int_array(obj, "n_node_samples")?,
        weighted_n_node_samples: float_array(obj, "weighted_n_node_samples")?,
        missing_go_to_left: match obj.get("missing_go_to_left") {
            None | Some(Value::Null) => None,
            Some(_) => Some(
                int_array(obj, "missing_go_to_left")?
                    .into_iter()
                    .map(|v| flag_byte(v, "missing_go_to_left"))
                    .collect::<Result<_>>()?,
            ),
        },
        ..LegacyTree::default()
    })
}

/// Field order of a positional node record.
const RECORD_FIELDS: [&str; 8] = [
    "left_child",
    "right_child",
    "feature",
    "threshold",
    "impurity",
    "n_node_samples",
    "weighted_n_node_samples",
    "missing_go_to_left",
];

fn read_node_records(obj: &Map<String, Value>) -> Result<LegacyTree> {
    let records = obj
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| VetreeError::corrupt("'nodes' must be an array of records"))?;

    let mut tree = LegacyTree::default();
    let mut flags: Vec<u8> = Vec::new();
    let mut with_flag = None;

    for (i, record) in records.iter().enumerate() {
        let fields: Vec<&Value> = match record {
            Value::Array(items) if items.len() == 7 || items.len() == 8 => items.iter().collect(),
            Value::Array(items) => {
                return Err(VetreeError::corrupt(format!(
                    "node record {i} has {} fields, expected 7 or 8",
                    items.len()
                )))
            }
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(8);
                for name in &RECORD_FIELDS[..7] {
                    fields.push(map.get(*name).ok_or_else(|| {
                        VetreeError::corrupt(format!("node record {i} is missing '{name}'"))
                    })?);
                }
                if let Some(flag) = map.get(RECORD_FIELDS[7]) {
                    fields.push(flag);
                }
                fields
            }
            other => {
                return Err(VetreeError::corrupt(format!(
                    "node record {i} is neither an array nor an object: {other}"
                )))
            }
        };

        let has_flag = fields.len() == 8;
        match with_flag {
            None => with_flag = Some(has_flag),
            Some(expected) if expected != has_flag => {
                return Err(VetreeError::corrupt(format!(
                    "node record {i} disagrees with earlier records on the missing-direction column"
                )))
            }
            Some(_) => {}
        }

        let ctx = |field: &str| format!("nodes[{i}].{field}");
        tree.children_left.push(as_int(fields[0], &ctx("left_child"))?);
        tree.children_right.push(as_int(fields[1], &ctx("right_child"))?);
        tree.feature.push(as_int(fields[2], &ctx("feature"))?);
        tree.threshold.push(as_float(fields[3], &ctx("threshold"))?);
        tree.impurity.push(as_float(fields[4], &ctx("impurity"))?);
        tree.n_node_samples.push(as_int(fields[5], &ctx("n_node_samples"))?);
        tree.weighted_n_node_samples
            .push(as_float(fields[6], &ctx("weighted_n_node_samples"))?);
        if has_flag {
            let raw = as_int(fields[7], &ctx("missing_go_to_left"))?;
            flags.push(flag_byte(raw, &ctx("missing_go_to_left"))?);
        }
    }

    if with_flag == Some(true) {
        tree.missing_go_to_left = Some(flags);
    }
    Ok(tree)
}

/// `value` is `node_count x n_classes` or `node_count x 1 x n_classes`.
fn read_value_table(obj: &Map<String, Value>) -> Result<Vec<Vec<f64>>> {
    let rows = obj
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| VetreeError::corrupt("tree component has no 'value' table"))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let row = row
                .as_array()
                .ok_or_else(|| VetreeError::corrupt(format!("value[{i}] is not an array")))?;
            let row = match row.first() {
                Some(Value::Array(_)) if row.len() == 1 => row[0]
                    .as_array()
                    .map(Vec::as_slice)
                    .unwrap_or_default(),
                Some(Value::Array(_)) => {
                    return Err(VetreeError::corrupt(format!(
                        "value[{i}] has {} outputs; only single-output trees are supported",
                        row.len()
                    )))
                }
                _ => row.as_slice(),
            };
            row.iter()
                .enumerate()
                .map(|(j, v)| as_float(v, &format!("value[{i}][{j}]")))
                .collect()
        })
        .collect()
}

fn string_list(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(VetreeError::corrupt(format!(
                    "'{field}' entries must be strings, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(VetreeError::corrupt(format!(
            "'{field}' must be a list, got {other}"
        ))),
    }
}

fn int_array(obj: &Map<String, Value>, field: &str) -> Result<Vec<i64>> {
    array_field(obj, field)?
        .iter()
        .enumerate()
        .map(|(i, v)| as_int(v, &format!("{field}[{i}]")))
        .collect()
}

fn float_array(obj: &Map<String, Value>, field: &str) -> Result<Vec<f64>> {
    array_field(obj, field)?
        .iter()
        .enumerate()
        .map(|(i, v)| as_float(v, &format!("{field}[{i}]")))
        .collect()
}

fn array_field<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Vec<Value>> {
    obj.get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| VetreeError::corrupt(format!("tree component has no '{field}' array")))
}

fn opt_usize(obj: &Map<String, Value>, field: &str) -> Result<Option<usize>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = as_int(v, field)?;
            usize::try_from(n)
                .map(Some)
                .map_err(|_| VetreeError::corrupt(format!("'{field}' must be non-negative, got {n}")))
        }
    }
}

// Integral floats (`3.0`) are accepted; exporters are not consistent.
fn as_int(value: &Value, ctx: &str) -> Result<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(f as i64),
        _ => Err(VetreeError::corrupt(format!("{ctx} must be an integer, got {value}"))),
    }
}

fn as_float(value: &Value, ctx: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| VetreeError::corrupt(format!("{ctx} must be a number, got {value}")))
}

fn flag_byte(raw: i64, ctx: &str) -> Result<u8> {
    match raw {
        0 | 1 => Ok(raw as u8),
        other => Err(VetreeError::corrupt(format!("{ctx} must be 0 or 1, got {other}"))),
    }
}
