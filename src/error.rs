use thiserror::Error;

use knn_core::{IteratorError, QuantizationError, StateFormatError};
use knn_native::{IndexFormatError, NativeError};

/// Errors surfaced by the engine.
///
/// `Clone` so one failed cache load can be handed to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnnError {
    #[error("capacity exceeded: need {requested} bytes, {available} of {capacity} available")]
    CapacityExceeded {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("native operation failed: {0}")]
    NativeOperationFailure(#[from] NativeError),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("training cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(String),
}

impl KnnError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KnnError::CapacityExceeded { .. } | KnnError::Io(_))
    }
}

impl From<std::io::Error> for KnnError {
    fn from(e: std::io::Error) -> Self {
        KnnError::Io(e.to_string())
    }
}

impl From<QuantizationError> for KnnError {
    fn from(e: QuantizationError) -> Self {
        match e {
            QuantizationError::DimensionMismatch { expected, actual } => {
                KnnError::DimensionMismatch { expected, actual }
            }
            QuantizationError::MissingSample { .. } | QuantizationError::EmptySample => {
                KnnError::DataCorruption(e.to_string())
            }
            QuantizationError::UnsupportedState { .. } => KnnError::InvalidArgument(e.to_string()),
        }
    }
}

impl From<IteratorError> for KnnError {
    fn from(e: IteratorError) -> Self {
        match e {
            IteratorError::DimensionMismatch { expected, actual } => {
                KnnError::DimensionMismatch { expected, actual }
            }
            IteratorError::Quantization(q) => q.into(),
            other => KnnError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<StateFormatError> for KnnError {
    fn from(e: StateFormatError) -> Self {
        KnnError::DataCorruption(format!("quantization state: {e}"))
    }
}

impl From<IndexFormatError> for KnnError {
    fn from(e: IndexFormatError) -> Self {
        KnnError::DataCorruption(format!("index file: {e}"))
    }
}

impl From<serde_json::Error> for KnnError {
    fn from(e: serde_json::Error) -> Self {
        KnnError::DataCorruption(format!("model metadata: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, KnnError>;
