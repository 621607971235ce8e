//! Offline conversion of legacy artifacts to the current binary format.
//!
//! Migration is the only path by which untyped legacy data becomes an
//! [`Artifact`]. The pipeline is: read the layout, check the per-node arrays
//! agree in length, normalise leaf sentinels, fill in the missing-direction
//! column, validate, and only then write. A failure at any stage leaves the
//! destination untouched.

use crate::artifact::{Artifact, MigrationRecord, Provenance};
use crate::config::{MigrationConfig, TypeResolution};
use crate::errors::{Result, VetreeError};
use crate::legacy::{self, LegacyArtifact, LegacyTree};
use crate::schema::FeatureSchema;
use crate::tree::{MissingDirection, TreeNode, TreeNodeTable, LEAF_FEATURE, NO_CHILD};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Convert raw legacy bytes into a validated artifact without touching disk.
pub fn migrate_bytes(bytes: &[u8], policy: TypeResolution) -> Result<Artifact> {
    let legacy = legacy::read_legacy(bytes, policy)?;
    convert(legacy)
}

/// Build a current-format artifact from parsed legacy data.
pub fn convert(legacy: LegacyArtifact) -> Result<Artifact> {
    let LegacyArtifact {
        layout,
        model_type,
        features,
        labels,
        tree,
    } = legacy;

    let node_count = check_lengths(&tree)?;
    let (nodes, normalised) = build_nodes(&tree, node_count)?;
    if normalised > 0 {
        warn!(normalised, "leaf split-feature sentinels rewritten to -1");
    }
    if tree.missing_go_to_left.is_none() {
        debug!("legacy tree has no missing-direction column; defaulting to go-right");
    }

    let n_features = match (tree.n_features, features.len()) {
        (Some(n), _) => n,
        (None, len) if len > 0 => len,
        (None, _) => nodes
            .iter()
            .filter(|n| !n.is_leaf())
            .filter_map(|n| usize::try_from(n.split_feature).ok())
            .map(|f| f + 1)
            .max()
            .unwrap_or(0),
    };

    let table = TreeNodeTable::from_rows(nodes, tree.value, n_features)?;
    if let Some(declared) = tree.n_classes {
        if declared != table.n_classes() {
            return Err(VetreeError::corrupt(format!(
                "model declares {declared} classes but the value table has {}",
                table.n_classes()
            )));
        }
    }

    let schema = FeatureSchema::new(features)?;
    let provenance = Provenance {
        migrated_from: Some(MigrationRecord {
            layout: layout.to_string(),
            legacy_type: model_type,
        }),
        ..Provenance::now()
    };
    let artifact = Artifact::new(schema, table, labels, provenance)?;

    if let Some(declared) = tree.max_depth {
        let actual = artifact.table().max_depth();
        if declared != actual {
            warn!(declared, actual, "legacy max_depth disagrees with the migrated tree");
        }
    }

    Ok(artifact)
}

/// Every per-node array must have the same length. Returns that length.
fn check_lengths(tree: &LegacyTree) -> Result<usize> {
    let mut lengths = vec![
        ("children_left", tree.children_left.len()),
        ("children_right", tree.children_right.len()),
        ("feature", tree.feature.len()),
        ("threshold", tree.threshold.len()),
        ("impurity", tree.impurity.len()),
        ("n_node_samples", tree.n_node_samples.len()),
        ("weighted_n_node_samples", tree.weighted_n_node_samples.len()),
        ("value", tree.value.len()),
    ];
    if let Some(flags) = &tree.missing_go_to_left {
        lengths.push(("missing_go_to_left", flags.len()));
    }

    let expected = tree.node_count.unwrap_or(lengths[0].1);
    if lengths.iter().any(|(_, len)| *len != expected) {
        let detail = lengths
            .iter()
            .map(|(name, len)| format!("{name}={len}"))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(VetreeError::corrupt(format!(
            "legacy node arrays disagree in length (node_count={expected}): {detail}"
        )));
    }
    Ok(expected)
}

/// Assemble typed nodes. Returns them with the number of leaf sentinels
/// that were rewritten.
fn build_nodes(tree: &LegacyTree, node_count: usize) -> Result<(Vec<TreeNode>, usize)> {
    let mut nodes = Vec::with_capacity(node_count);
    let mut normalised = 0;

    for i in 0..node_count {
        let left_child = tree.children_left[i];
        let right_child = tree.children_right[i];
        let mut split_feature = tree.feature[i];

        // Older writers mark leaves with -2.
        if left_child == NO_CHILD
            && right_child == NO_CHILD
            && split_feature < 0
            && split_feature != LEAF_FEATURE
        {
            split_feature = LEAF_FEATURE;
            normalised += 1;
        }

        let missing_direction = match &tree.missing_go_to_left {
            Some(flags) => MissingDirection::from_flag(flags[i]).ok_or_else(|| {
                VetreeError::corrupt(format!("node {i} has missing-direction flag {}", flags[i]))
            })?,
            None => MissingDirection::GoRight,
        };

        nodes.push(TreeNode {
            left_child,
            right_child,
            split_feature,
            threshold: tree.threshold[i],
            impurity: tree.impurity[i],
            sample_count: tree.n_node_samples[i],
            weighted_sample_count: tree.weighted_n_node_samples[i],
            missing_direction,
        });
    }

    Ok((nodes, normalised))
}

/// Migrate the legacy artifact at `legacy_path` and write it to `new_path`.
///
/// An existing file at `new_path` is moved to a timestamped backup. Nothing is
/// written if reading, conversion or validation fails.
#[instrument(
    skip(legacy_path, new_path, config),
    fields(
        legacy = %legacy_path.as_ref().display(),
        target = %new_path.as_ref().display(),
        policy = ?config.type_resolution
    )
)]
pub fn migrate<P: AsRef<Path>, Q: AsRef<Path>>(
    legacy_path: P,
    new_path: Q,
    config: &MigrationConfig,
) -> Result<Artifact> {
    let legacy_path = legacy_path.as_ref();
    let new_path = new_path.as_ref();

    let bytes = fs::read(legacy_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => VetreeError::ArtifactNotFound(legacy_path.to_path_buf()),
        _ => VetreeError::Io(e),
    })?;

    let artifact = match migrate_bytes(&bytes, config.type_resolution) {
        Ok(artifact) => artifact,
        Err(e) => {
            warn!(error = %e, "migration aborted; nothing written");
            return Err(e);
        }
    };

    let backup = artifact.save(new_path, &config.backup_suffix)?;

    let layout = artifact
        .provenance()
        .migrated_from
        .as_ref()
        .map(|m| m.layout.clone())
        .unwrap_or_default();
    info!(
        %layout,
        nodes = artifact.table().node_count(),
        features = artifact.schema().len(),
        classes = artifact.table().n_classes(),
        backup = ?backup,
        "legacy artifact migrated"
    );
    Ok(artifact)
}
