//! Decision-tree artifacts for livestock health triage
//!
//! Loads a versioned, checksummed tree artifact, encodes raw health reports
//! into schema-ordered feature vectors and walks the tree to a diagnosis
//! label with a confidence score. Legacy artifacts are converted offline by
//! the migrator; serving only ever reads the current format.
//!
//! Modules:
//! - `schema`: Ordered, duplicate-free feature names
//! - `features`: Report to feature vector encoding
//! - `tree`: Flat node table and its structural invariants
//! - `inference`: Traversal and leaf scoring
//! - `format`: Binary layout of the artifact file
//! - `artifact`: Validated artifact, load and atomic save
//! - `legacy`: Reader for the closed set of legacy layouts
//! - `migrate`: Legacy to current conversion
//! - `canon`: Canonical JSON export
//! - `config`: TOML configuration

pub mod artifact;
pub mod canon;
pub mod config;
pub mod errors;
pub mod features;
pub mod format;
pub mod inference;
pub mod legacy;
pub mod migrate;
pub mod schema;
pub mod tree;

pub use artifact::{load_artifact, Artifact, ArtifactSummary, MigrationRecord, Prediction, Provenance};
pub use canon::export_canonical_json;
pub use config::{ArtifactConfig, EncoderConfig, MigrationConfig, TypeResolution, VetreeConfig};
pub use errors::{Result, VetreeError};
pub use features::{build_feature_vector, normalize_token, FeatureEncoder, FeatureVector};
pub use legacy::LegacyLayout;
pub use migrate::{migrate, migrate_bytes};
pub use schema::FeatureSchema;
pub use tree::{MissingDirection, TreeNode, TreeNodeTable};

/// Crate version string recorded in artifact provenance
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Encode `report` against the artifact's schema and score it.
pub fn predict(artifact: &Artifact, report: &serde_json::Value) -> Result<Prediction> {
    artifact.predict(report)
}
