//! The serving artifact: feature schema, node table and label list.
//!
//! An [`Artifact`] is only ever constructed validated. Loading checks the
//! binary layout, the checksum and every table invariant; saving is atomic
//! and moves an existing file aside instead of overwriting it.

use crate::errors::{Result, VetreeError};
use crate::features::{FeatureEncoder, FeatureVector};
use crate::format::{self, CURRENT_FORMAT_VERSION, LEGACY_FORMAT_VERSION};
use crate::inference;
use crate::schema::FeatureSchema;
use crate::tree::TreeNodeTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Where an artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Tool and version that wrote the artifact
    pub produced_by: String,
    pub created_at: DateTime<Utc>,
    /// Set when the artifact was converted from a legacy layout
    pub migrated_from: Option<MigrationRecord>,
}

impl Provenance {
    pub fn now() -> Self {
        Self {
            produced_by: format!("vetree-core {}", crate::VERSION),
            created_at: Utc::now(),
            migrated_from: None,
        }
    }
}

/// Details of the legacy input a migrated artifact was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Structural layout recognised in the legacy input
    pub layout: String,
    /// Type tag the legacy model claimed, if any
    pub legacy_type: Option<String>,
}

/// Trailing bincode section of the binary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMetadata {
    features: FeatureSchema,
    labels: Vec<String>,
    provenance: Provenance,
}

/// Predicted label for one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub label_index: usize,
    pub confidence: f64,
}

/// Facts about a loaded artifact, suitable for a health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub format_version: u16,
    pub features_count: usize,
    pub labels: Vec<String>,
    pub node_count: usize,
    pub leaf_count: usize,
    pub max_depth: usize,
    pub fingerprint: String,
    pub provenance: Provenance,
}

/// Feature schema, node table and labels. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    format_version: u16,
    schema: FeatureSchema,
    table: TreeNodeTable,
    labels: Vec<String>,
    provenance: Provenance,
}

impl Artifact {
    /// Build a current-format artifact, validating the table and its
    /// agreement with the schema and labels.
    pub fn new(
        schema: FeatureSchema,
        table: TreeNodeTable,
        labels: Vec<String>,
        provenance: Provenance,
    ) -> Result<Self> {
        let artifact = Self {
            format_version: CURRENT_FORMAT_VERSION,
            schema,
            table,
            labels,
            provenance,
        };
        artifact.validate()?;
        Ok(artifact)
    }

    /// Check table invariants plus schema and label agreement.
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;

        if self.schema.is_empty() {
            warn!("artifact has no feature schema; every prediction will be rejected");
        } else if self.schema.len() != self.table.n_features() {
            return Err(VetreeError::corrupt(format!(
                "schema has {} features but the tree was fitted on {}",
                self.schema.len(),
                self.table.n_features()
            )));
        }

        if !self.labels.is_empty() && self.labels.len() != self.table.n_classes() {
            return Err(VetreeError::corrupt(format!(
                "{} labels for a tree with {} classes",
                self.labels.len(),
                self.table.n_classes()
            )));
        }
        let mut seen = HashSet::with_capacity(self.labels.len());
        if let Some(dup) = self.labels.iter().find(|l| !seen.insert(l.as_str())) {
            return Err(VetreeError::corrupt(format!("duplicate label '{dup}'")));
        }

        Ok(())
    }

    pub fn format_version(&self) -> u16 {
        self.format_version
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn table(&self) -> &TreeNodeTable {
        &self.table
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Label text for a class index; the decimal index when no labels exist.
    pub fn label_for(&self, label_index: usize) -> Result<String> {
        if self.labels.is_empty() {
            return Ok(label_index.to_string());
        }
        self.labels.get(label_index).cloned().ok_or_else(|| {
            VetreeError::corrupt(format!(
                "class index {label_index} has no label ({} labels)",
                self.labels.len()
            ))
        })
    }

    /// Score an already-encoded feature vector.
    pub fn predict_vector(&self, vector: &[f64]) -> Result<Prediction> {
        if vector.len() != self.schema.len() {
            return Err(VetreeError::SchemaMismatch {
                expected: self.schema.len(),
                actual: vector.len(),
            });
        }
        let score = inference::predict(&self.table, vector)?;
        Ok(Prediction {
            label: self.label_for(score.label_index)?,
            label_index: score.label_index,
            confidence: score.confidence,
        })
    }

    /// Encode `report` with `encoder` and score it.
    pub fn predict_with(&self, encoder: &FeatureEncoder, report: &Value) -> Result<Prediction> {
        let vector: FeatureVector = encoder.build(report, &self.schema)?;
        self.predict_vector(&vector)
    }

    /// Encode `report` with the default encoder and score it.
    pub fn predict(&self, report: &Value) -> Result<Prediction> {
        self.predict_with(&FeatureEncoder::default(), report)
    }

    /// Serialize to the current binary layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let metadata = ArtifactMetadata {
            features: self.schema.clone(),
            labels: self.labels.clone(),
            provenance: self.provenance.clone(),
        };
        let metadata = bincode::serialize(&metadata)
            .map_err(|e| VetreeError::corrupt(format!("metadata encoding failed: {e}")))?;
        format::write_sections(
            CURRENT_FORMAT_VERSION,
            self.table.nodes(),
            self.table.values(),
            self.table.n_features(),
            self.table.n_classes(),
            &metadata,
        )
    }

    /// Parse and validate a current-format binary image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = format::read_sections(bytes)?;
        if raw.header.version == LEGACY_FORMAT_VERSION {
            return Err(VetreeError::corrupt(
                "artifact uses legacy format version 1; migrate it before serving",
            ));
        }

        let metadata: ArtifactMetadata = bincode::deserialize(raw.metadata)
            .map_err(|e| VetreeError::corrupt(format!("metadata section unreadable: {e}")))?;

        let n_features = usize::try_from(raw.header.n_features)
            .map_err(|_| VetreeError::corrupt("feature count too large"))?;
        let n_classes = usize::try_from(raw.header.n_classes)
            .map_err(|_| VetreeError::corrupt("class count too large"))?;
        let table = TreeNodeTable::new(raw.nodes, raw.values, n_features, n_classes)?;

        Artifact::new(metadata.features, table, metadata.labels, metadata.provenance)
    }

    /// BLAKE3 digest (hex) of the serialized body.
    pub fn fingerprint(&self) -> Result<String> {
        let bytes = self.to_bytes()?;
        Ok(hex::encode(&bytes[40..format::HEADER_SIZE]))
    }

    pub fn summary(&self) -> Result<ArtifactSummary> {
        Ok(ArtifactSummary {
            format_version: self.format_version,
            features_count: self.schema.len(),
            labels: self.labels.clone(),
            node_count: self.table.node_count(),
            leaf_count: self.table.leaf_count(),
            max_depth: self.table.max_depth(),
            fingerprint: self.fingerprint()?,
            provenance: self.provenance.clone(),
        })
    }

    /// Write atomically to `path`. An existing file there is renamed to a
    /// timestamped backup first. Returns the backup path, if one was made.
    pub fn save(&self, path: &Path, backup_suffix: &str) -> Result<Option<PathBuf>> {
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        // Dropped (and deleted) on any early return below.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;

        let backup = if path.exists() {
            // The replacement keeps the displaced file's mode, not tempfile's 0600.
            let permissions = fs::metadata(path)?.permissions();
            tmp.as_file().set_permissions(permissions)?;

            let backup = backup_path(path, backup_suffix);
            fs::rename(path, &backup)?;
            warn!(
                artifact = %path.display(),
                backup = %backup.display(),
                "existing artifact moved aside"
            );
            Some(backup)
        } else {
            None
        };

        tmp.persist(path).map_err(|e| VetreeError::Io(e.error))?;
        info!(artifact = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(backup)
    }
}

/// First free `<file>.<UTC timestamp>.<suffix>[.<n>]` next to `path`.
fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let base = path.with_file_name(format!("{file_name}.{stamp}.{suffix}"));
    if !base.exists() {
        return base;
    }
    (1u32..)
        .map(|n| path.with_file_name(format!("{file_name}.{stamp}.{suffix}.{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

/// Load and validate the artifact at `path`.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_artifact<P: AsRef<Path>>(path: P) -> Result<Artifact> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => VetreeError::ArtifactNotFound(path.to_path_buf()),
        _ => VetreeError::Io(e),
    })?;
    let artifact = Artifact::from_bytes(&bytes)?;
    info!(
        fingerprint = %hex::encode(&bytes[40..format::HEADER_SIZE]),
        features = artifact.schema.len(),
        nodes = artifact.table.node_count(),
        labels = artifact.labels.len(),
        "artifact loaded"
    );
    Ok(artifact)
}
