//! Error types for lora-rs.

use thiserror::Error;

/// Result type alias for lora-rs operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Errors that can occur in lora-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoraError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rank outside of `1..=max`.
    #[error("invalid rank {rank}: must be between 1 and {max}")]
    InvalidRank {
        /// Requested rank
        rank: usize,
        /// Largest admissible rank for the given dimensions
        max: usize,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// Singular value decomposition did not produce the requested factors.
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    /// Layer index out of range for the model being adapted.
    #[error("layer index {index} out of range for model with {len} dense layers")]
    LayerIndex {
        /// Requested index
        index: usize,
        /// Number of dense layers
        len: usize,
    },

    /// Dataset construction or loading error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
