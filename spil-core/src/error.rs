//! Errors in the library.
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug)]
pub enum SpilError {
    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),

    /// A transition batch lacks one of the required entries.
    #[error("Missing batch key: {0}")]
    MissingBatchKey(String),

    /// Entries of a transition batch disagree on their shapes.
    #[error("Batch shape mismatch in '{key}': expected {expected}, got {actual:?}")]
    BatchShapeMismatch {
        /// Name of the offending entry.
        key: String,
        /// Human readable description of the expected shape.
        expected: String,
        /// The shape that was found.
        actual: Vec<usize>,
    },

    /// Hyperparameters or dimensions are missing or malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A gradient for a parameter was not supplied.
    #[error("No gradient for parameter '{0}'")]
    MissingGradient(String),
}
