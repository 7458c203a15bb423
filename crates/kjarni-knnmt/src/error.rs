//! Error types for kNN-augmented decoding.

use kjarni_datastore::DatastoreError;
use thiserror::Error;

/// Errors that can occur while configuring or running a kNN decoder.
#[derive(Debug, Error)]
pub enum KnnError {
    /// Bad or missing mode, bad hyperparameters, lists too short for the
    /// enabled sources.
    #[error("Invalid knn configuration: {0}")]
    Configuration(String),

    /// Unreadable, malformed or incompatible datastore.
    #[error("Datastore error: {0}")]
    Storage(#[source] DatastoreError),

    /// Shapes that should agree do not.
    #[error("Dimension mismatch: {0}")]
    Dimension(String),

    /// The two halves of a decoding step were called out of order.
    #[error("Decoding step out of order: {0}")]
    StepOrder(String),

    /// The wrapped base decoder failed.
    #[error("Base decoder failed: {0}")]
    BaseDecoder(#[source] anyhow::Error),
}

impl From<DatastoreError> for KnnError {
    fn from(err: DatastoreError) -> Self {
        match err {
            DatastoreError::Dimension { expected, got } => {
                KnnError::Dimension(format!("datastore expects {}, got {}", expected, got))
            }
            DatastoreError::SubsetOutOfRange { .. } => KnnError::Dimension(err.to_string()),
            other => KnnError::Storage(other),
        }
    }
}

/// Result type for kNN decoding operations.
pub type KnnResult<T> = Result<T, KnnError>;
