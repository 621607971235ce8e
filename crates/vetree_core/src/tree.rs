//! Flat node table for a fitted classification tree.
//!
//! Nodes live in a single array and refer to each other by index; index 0 is
//! the root and `-1` marks "no child". Per-node class weights live in a dense
//! value table with `n_classes` entries per node, so the in-memory layout and
//! the on-disk record layout are the same shape.

use crate::errors::{Result, VetreeError};
use serde::{Deserialize, Serialize};

/// Child sentinel for leaves.
pub const NO_CHILD: i64 = -1;

/// Split-feature sentinel for leaves.
pub const LEAF_FEATURE: i64 = -1;

/// Branch taken when the split feature's value is absent (`NaN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MissingDirection {
    GoLeft,
    /// Legacy trees never branched on missing values; migration fills this in.
    #[default]
    GoRight,
}

impl MissingDirection {
    /// On-disk flag byte.
    pub fn to_flag(self) -> u8 {
        match self {
            MissingDirection::GoLeft => 1,
            MissingDirection::GoRight => 0,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            1 => Some(MissingDirection::GoLeft),
            0 => Some(MissingDirection::GoRight),
            _ => None,
        }
    }
}

/// One row of the node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub left_child: i64,
    pub right_child: i64,
    /// Column index into the feature schema, `-1` for leaves
    pub split_feature: i64,
    /// Go left when `value <= threshold`
    pub threshold: f64,
    pub impurity: f64,
    pub sample_count: i64,
    pub weighted_sample_count: f64,
    pub missing_direction: MissingDirection,
}

impl TreeNode {
    /// Create a split node.
    pub fn internal(split_feature: i64, threshold: f64, left_child: i64, right_child: i64) -> Self {
        Self {
            left_child,
            right_child,
            split_feature,
            threshold,
            impurity: 0.0,
            sample_count: 0,
            weighted_sample_count: 0.0,
            missing_direction: MissingDirection::GoRight,
        }
    }

    /// Create a leaf node.
    pub fn leaf() -> Self {
        Self {
            left_child: NO_CHILD,
            right_child: NO_CHILD,
            split_feature: LEAF_FEATURE,
            threshold: 0.0,
            impurity: 0.0,
            sample_count: 0,
            weighted_sample_count: 0.0,
            missing_direction: MissingDirection::GoRight,
        }
    }

    pub fn with_stats(mut self, impurity: f64, sample_count: i64, weighted_sample_count: f64) -> Self {
        self.impurity = impurity;
        self.sample_count = sample_count;
        self.weighted_sample_count = weighted_sample_count;
        self
    }

    pub fn with_missing_direction(mut self, direction: MissingDirection) -> Self {
        self.missing_direction = direction;
        self
    }

    /// A node is a leaf when its split feature is the leaf sentinel.
    pub fn is_leaf(&self) -> bool {
        self.split_feature == LEAF_FEATURE
    }
}

/// The structural payload of an artifact: node rows plus class weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNodeTable")]
pub struct TreeNodeTable {
    nodes: Vec<TreeNode>,
    /// Row-major `nodes.len() x n_classes`
    values: Vec<f64>,
    n_features: usize,
    n_classes: usize,
}

/// Unchecked wire form; deserialization goes through [`TreeNodeTable::new`].
#[derive(Deserialize)]
struct RawNodeTable {
    nodes: Vec<TreeNode>,
    values: Vec<f64>,
    n_features: usize,
    n_classes: usize,
}

impl TryFrom<RawNodeTable> for TreeNodeTable {
    type Error = VetreeError;

    fn try_from(raw: RawNodeTable) -> Result<Self> {
        TreeNodeTable::new(raw.nodes, raw.values, raw.n_features, raw.n_classes)
    }
}

impl TreeNodeTable {
    /// Assemble a table. Only the value-table shape is checked here; call
    /// [`TreeNodeTable::validate`] for the structural invariants.
    pub fn new(
        nodes: Vec<TreeNode>,
        values: Vec<f64>,
        n_features: usize,
        n_classes: usize,
    ) -> Result<Self> {
        if nodes.len().checked_mul(n_classes) != Some(values.len()) {
            return Err(VetreeError::corrupt(format!(
                "value table has {} entries, expected {} nodes x {} classes",
                values.len(),
                nodes.len(),
                n_classes
            )));
        }
        Ok(Self {
            nodes,
            values,
            n_features,
            n_classes,
        })
    }

    /// Build from nodes and one class-weight row per node.
    pub fn from_rows(nodes: Vec<TreeNode>, rows: Vec<Vec<f64>>, n_features: usize) -> Result<Self> {
        if rows.len() != nodes.len() {
            return Err(VetreeError::corrupt(format!(
                "{} value rows for {} nodes",
                rows.len(),
                nodes.len()
            )));
        }
        let n_classes = rows.first().map_or(0, Vec::len);
        if let Some(i) = rows.iter().position(|r| r.len() != n_classes) {
            return Err(VetreeError::corrupt(format!(
                "value row {i} has {} classes, expected {n_classes}",
                rows[i].len()
            )));
        }
        Self::new(nodes, rows.concat(), n_features, n_classes)
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub(crate) fn values(&self) -> &[f64] {
        &self.values
    }

    /// Class weights stored for node `idx`, leaf or not.
    pub fn node_values(&self, idx: usize) -> Option<&[f64]> {
        if idx >= self.nodes.len() {
            return None;
        }
        let start = idx * self.n_classes;
        Some(&self.values[start..start + self.n_classes])
    }

    /// Class weights of leaf `idx`; `None` for internal nodes.
    pub fn leaf_distribution(&self, idx: usize) -> Option<&[f64]> {
        match self.nodes.get(idx) {
            Some(node) if node.is_leaf() => self.node_values(idx),
            _ => None,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Depth of the deepest leaf (root alone is depth 0). Assumes a
    /// validated table; cycles are cut off at `node_count`.
    pub fn max_depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = Vec::new();
        if !self.nodes.is_empty() {
            stack.push((0usize, 0usize));
        }
        while let Some((idx, depth)) = stack.pop() {
            if depth > self.nodes.len() {
                break;
            }
            deepest = deepest.max(depth);
            let node = &self.nodes[idx];
            if node.is_leaf() {
                continue;
            }
            for child in [node.left_child, node.right_child] {
                if child >= 0 && (child as usize) < self.nodes.len() {
                    stack.push((child as usize, depth + 1));
                }
            }
        }
        deepest
    }

    /// Check the structural invariants: non-empty, well-formed leaves and
    /// splits, children in range, every non-root node reached exactly once
    /// from the root, and sane class weights.
    pub fn validate(&self) -> Result<()> {
        let n = self.nodes.len();
        if n == 0 {
            return Err(VetreeError::corrupt("node table is empty"));
        }
        if self.n_classes == 0 {
            return Err(VetreeError::corrupt("node table has no classes"));
        }

        for (i, node) in self.nodes.iter().enumerate() {
            let left_none = node.left_child == NO_CHILD;
            let right_none = node.right_child == NO_CHILD;

            if left_none != right_none {
                return Err(VetreeError::corrupt(format!(
                    "node {i} has exactly one child ({}, {})",
                    node.left_child, node.right_child
                )));
            }

            if left_none {
                if node.split_feature != LEAF_FEATURE {
                    return Err(VetreeError::corrupt(format!(
                        "leaf node {i} has split feature {}",
                        node.split_feature
                    )));
                }
            } else {
                if node.split_feature < 0 || node.split_feature as usize >= self.n_features {
                    return Err(VetreeError::corrupt(format!(
                        "node {i} splits on feature {} but table has {} features",
                        node.split_feature, self.n_features
                    )));
                }
                for child in [node.left_child, node.right_child] {
                    if child < 0 || child as usize >= n {
                        return Err(VetreeError::corrupt(format!(
                            "node {i} references child {child} but table has {n} nodes"
                        )));
                    }
                    if child == 0 {
                        return Err(VetreeError::corrupt(format!(
                            "node {i} points back at the root"
                        )));
                    }
                }
                if !node.threshold.is_finite() {
                    return Err(VetreeError::corrupt(format!(
                        "node {i} has non-finite threshold {}",
                        node.threshold
                    )));
                }
            }

            let row = &self.values[i * self.n_classes..(i + 1) * self.n_classes];
            if let Some(v) = row.iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(VetreeError::corrupt(format!(
                    "node {i} has invalid class weight {v}"
                )));
            }
            if left_none && row.iter().sum::<f64>() <= 0.0 {
                return Err(VetreeError::corrupt(format!(
                    "leaf node {i} has an all-zero class distribution"
                )));
            }
        }

        // Walk from the root; a revisit means a shared child or a cycle.
        let mut visited = vec![false; n];
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            if visited[idx] {
                return Err(VetreeError::corrupt(format!(
                    "node {idx} is reachable along more than one path"
                )));
            }
            visited[idx] = true;
            let node = &self.nodes[idx];
            if !node.is_leaf() {
                stack.push(node.right_child as usize);
                stack.push(node.left_child as usize);
            }
        }
        if let Some(orphan) = visited.iter().position(|v| !v) {
            return Err(VetreeError::corrupt(format!(
                "node {orphan} is not reachable from the root"
            )));
        }

        Ok(())
    }
}
