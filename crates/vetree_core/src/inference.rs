//! Tree traversal and leaf scoring.
//!
//! Traversal never trusts the table: child indices are bounds-checked and the
//! walk is capped at `node_count` steps, so a corrupted table produces an
//! error instead of a panic or an endless loop.

use crate::errors::{Result, VetreeError};
use crate::tree::{MissingDirection, TreeNodeTable};

/// Outcome of walking the tree for one feature vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafScore {
    /// Column of the winning class in the value table
    pub label_index: usize,
    /// Winning weight over the leaf's total weight, in `[0, 1]`
    pub confidence: f64,
    /// Node index of the leaf that was reached
    pub leaf: usize,
}

/// Index of the leaf reached by `vector`.
///
/// Goes left when `value <= threshold`. A `NaN` value follows the node's
/// missing direction.
pub fn find_leaf(table: &TreeNodeTable, vector: &[f64]) -> Result<usize> {
    if table.is_empty() {
        return Err(VetreeError::corrupt("node table is empty"));
    }
    if vector.len() != table.n_features() {
        return Err(VetreeError::SchemaMismatch {
            expected: table.n_features(),
            actual: vector.len(),
        });
    }

    let node_count = table.node_count();
    let mut idx = 0usize;

    for _ in 0..=node_count {
        let node = &table.nodes()[idx];
        if node.is_leaf() {
            return Ok(idx);
        }

        let feature = usize::try_from(node.split_feature)
            .ok()
            .filter(|f| *f < vector.len())
            .ok_or_else(|| {
                VetreeError::corrupt(format!(
                    "node {idx} splits on feature {} outside the {}-feature vector",
                    node.split_feature,
                    vector.len()
                ))
            })?;

        let value = vector[feature];
        let go_left = if value.is_nan() {
            node.missing_direction == MissingDirection::GoLeft
        } else {
            value <= node.threshold
        };
        let next = if go_left { node.left_child } else { node.right_child };

        idx = usize::try_from(next)
            .ok()
            .filter(|c| *c < node_count)
            .ok_or_else(|| {
                VetreeError::corrupt(format!(
                    "node {idx} references child {next} but table has {node_count} nodes"
                ))
            })?;
    }

    Err(VetreeError::corrupt(format!(
        "no leaf reached within {node_count} steps; the table contains a cycle"
    )))
}

/// Arg-max and normalised weight of a class distribution. Ties go to the
/// lowest index.
pub fn score_distribution(distribution: &[f64]) -> Result<(usize, f64)> {
    let mut best_idx = 0usize;
    let mut best = f64::NEG_INFINITY;
    let mut total = 0.0;

    for (i, &weight) in distribution.iter().enumerate() {
        if !weight.is_finite() || weight < 0.0 {
            return Err(VetreeError::corrupt(format!(
                "class weight {weight} at index {i} is not a finite non-negative number"
            )));
        }
        total += weight;
        if weight > best {
            best = weight;
            best_idx = i;
        }
    }

    if total <= 0.0 {
        return Err(VetreeError::corrupt("leaf class distribution sums to zero"));
    }

    Ok((best_idx, (best / total).clamp(0.0, 1.0)))
}

/// Walk `table` for `vector` and score the leaf reached.
pub fn predict(table: &TreeNodeTable, vector: &[f64]) -> Result<LeafScore> {
    let leaf = find_leaf(table, vector)?;
    let distribution = table
        .leaf_distribution(leaf)
        .ok_or_else(|| VetreeError::corrupt(format!("leaf {leaf} has no class distribution")))?;
    let (label_index, confidence) = score_distribution(distribution)?;
    Ok(LeafScore {
        label_index,
        confidence,
        leaf,
    })
}
