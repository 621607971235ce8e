//! Error types for the vetree core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, migrating or evaluating an artifact
#[derive(Error, Debug)]
pub enum VetreeError {
    /// Artifact file missing at load time
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// Structural invariant violated in an artifact or node table
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Feature vector length does not match the schema the tree was built on
    #[error("Schema mismatch: expected {expected} features, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    /// A report field is present but cannot be encoded
    #[error("Invalid report: {0}")]
    InvalidReport(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VetreeError {
    /// Shorthand for building a corruption error from anything printable.
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        VetreeError::CorruptArtifact(msg.into())
    }

    /// True for errors that mean the artifact itself cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, VetreeError::CorruptArtifact(_))
    }
}

/// Result type for vetree operations
pub type Result<T> = std::result::Result<T, VetreeError>;
