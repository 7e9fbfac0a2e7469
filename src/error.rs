//! Error types for document operations.
//!
//! Every fallible operation in the crate returns [`DocError`]. Missing data
//! (an absent content stream, an artifact type never written) is not an
//! error: lookups return `Option` or an empty `Vec` instead.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for document operations.
#[derive(Debug, Error)]
pub enum DocError {
    /// a mutation was attempted on a document opened read-only
    #[error("document is read-only: {operation} is not permitted")]
    AccessViolation { operation: &'static str },

    /// a write-once artifact already holds a value
    #[error("artifact '{artifact_type}' is write-once and already exists")]
    WriteOnceViolation { artifact_type: String },

    /// required tables are missing from the file
    #[error("document structure is invalid, missing: {}", missing.join(", "))]
    Structural { missing: Vec<String> },

    /// a stored diff could not be reversed onto the text it should follow
    #[error("cannot reconstruct content past diff {diff_id}: {reason}")]
    PatchReconstruction { diff_id: i64, reason: String },

    /// the target of a create or import already exists
    #[error("document already exists: {}", path.display())]
    Conflict { path: PathBuf },

    /// the handle was closed
    #[error("document is closed")]
    Closed,

    /// a stored value could not be decoded into its field type
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// the file was written by a newer schema generation than this build knows
    #[error("unsupported schema version {found} (newest known is {supported})")]
    UnsupportedVersion { found: i64, supported: i64 },

    /// error from the SQLite driver
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DocError {
    pub fn invalid_value(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from the document's access policy rather than
    /// from storage.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::AccessViolation { .. } | Self::WriteOnceViolation { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DocError>;
