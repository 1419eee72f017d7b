//! Error types for layer-quant.

use candle_core::DType;
use thiserror::Error;

/// Result type alias for layer-quant operations.
pub type Result<T> = std::result::Result<T, QuantError>;

/// Errors that can occur in layer-quant operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QuantError {
    /// A configuration node is missing an expected field, or holds the wrong kind of value.
    #[error("schema violation on {kind}.{field}: {reason}")]
    SchemaViolation {
        /// Layer kind of the offending node
        kind: String,
        /// Field that was looked up
        field: String,
        /// What was wrong with it
        reason: String,
    },

    /// The requested quantization scheme or mode is not supported.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Tensor dtype differs from the compute dtype.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        actual: DType,
    },

    /// Malformed einsum equation.
    #[error("invalid einsum equation: {0}")]
    InvalidEquation(String),

    /// Invalid hyper-parameters or variable setup.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl QuantError {
    pub(crate) fn schema(kind: impl ToString, field: &str, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            kind: kind.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error signals a missing feature rather than a misconfiguration.
    #[must_use]
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }

    /// Whether this error is a structural config violation.
    #[must_use]
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaViolation { .. })
    }
}
