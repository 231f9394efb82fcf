//! Error taxonomy for the retrieval path.

use thiserror::Error;

/// Errors raised by fragment storage and ingestion validation.
///
/// Only [`RetrievalError::TransientRetrieval`] is worth retrying; every
/// other variant describes a request that will fail the same way again.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrievalError {
    /// Store timeout or temporarily unavailable backend.
    #[error("transient retrieval error: {0}")]
    TransientRetrieval(String),

    /// Malformed ingestion input.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A vector's dimension disagrees with the fragment or model it belongs to.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RetrievalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RetrievalError::TransientRetrieval(_))
    }

    /// Stable machine-readable code used in API result flags.
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::TransientRetrieval(_) => "retrieval_unavailable",
            RetrievalError::Validation(_) => "bad_request",
            RetrievalError::NotFound(_) => "not_found",
            RetrievalError::DimensionMismatch { .. } => "dimension_mismatch",
            RetrievalError::Storage(_) => "storage_error",
        }
    }
}
