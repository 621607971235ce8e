//! Configuration for artifact location, report encoding and migration policy.
//!
//! Every section has a `Default`, so an absent or partial TOML file is fine:
//!
//! ```toml
//! [artifact]
//! path = "models/decision_tree.vtra"
//!
//! [encoder]
//! numeric_fields = ["age", "body_temperature"]
//! categorical_field = "animal_type"
//! categorical_prefix = "animal_"
//! multi_hot_field = "symptoms"
//! token_separator = "_"
//!
//! [migration]
//! type_resolution = "strict"
//! backup_suffix = "bak"
//! ```

use crate::errors::{Result, VetreeError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct VetreeConfig {
    /// Serving artifact location
    pub artifact: ArtifactConfig,
    /// Raw report to feature vector encoding
    pub encoder: EncoderConfig,
    /// Offline migration behaviour
    pub migration: MigrationConfig,
}

/// Serving artifact location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Path of the current-format artifact
    pub path: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/decision_tree.vtra"),
        }
    }
}

/// How report fields map onto schema columns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Fields copied into the column of the same name
    pub numeric_fields: Vec<String>,
    /// Field one-hot encoded as `<categorical_prefix><lowercased value>`
    pub categorical_field: String,
    pub categorical_prefix: String,
    /// Field holding a list of free-text tokens, each normalised to a column name
    pub multi_hot_field: String,
    /// Replaces spaces in a normalised token
    pub token_separator: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            numeric_fields: vec!["age".to_string(), "body_temperature".to_string()],
            categorical_field: "animal_type".to_string(),
            categorical_prefix: "animal_".to_string(),
            multi_hot_field: "symptoms".to_string(),
            token_separator: "_".to_string(),
        }
    }
}

/// What to do when a legacy object claims a type the reader does not know
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TypeResolution {
    /// Unrecognised type tags fail the migration
    #[default]
    Strict,
    /// Unrecognised type tags are logged and the structural layout decides
    Permissive,
}

/// Offline migration behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    pub type_resolution: TypeResolution,
    /// Extension appended to a displaced artifact file
    pub backup_suffix: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            type_resolution: TypeResolution::Strict,
            backup_suffix: "bak".to_string(),
        }
    }
}

impl VetreeConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| VetreeError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file. Relative artifact paths are
    /// resolved against the file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            VetreeError::Config(format!("unable to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.artifact.path = resolve_relative(path, &config.artifact.path);
        debug!(
            config = %path.display(),
            artifact = %config.artifact.path.display(),
            "configuration loaded"
        );
        Ok(config)
    }
}

fn resolve_relative(config_path: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return target.to_path_buf();
    }

    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let candidate = base.join(target);
    if candidate.exists() {
        return candidate;
    }

    let cwd_candidate = env::current_dir()
        .map(|cwd| cwd.join(target))
        .unwrap_or_else(|_| target.to_path_buf());
    if cwd_candidate.exists() {
        return cwd_candidate;
    }

    // Neither exists yet; keep it next to the config so migrate writes there.
    candidate
}
