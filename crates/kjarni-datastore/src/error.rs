//! Error types for datastore operations.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while building, loading or searching a datastore.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Reading or writing a datastore file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A datastore file exists but its contents cannot be interpreted.
    #[error("Malformed datastore file '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// The datastore is readable but cannot serve the requested operation.
    #[error("Incompatible datastore '{path}': {reason}")]
    Incompatible { path: PathBuf, reason: String },

    /// Vector width disagrees with the datastore.
    #[error("Dimension mismatch: datastore expects {expected}, got {got}")]
    Dimension { expected: usize, got: usize },

    /// A subset entry id does not exist in the index.
    #[error("Subset id {id} is out of range for an index of {size} entries")]
    SubsetOutOfRange { id: i64, size: usize },

    /// A table was used without being loaded.
    #[error("Table '{0}' is not loaded")]
    TableNotLoaded(&'static str),

    /// Search was attempted before an index was attached.
    #[error("No similarity index loaded for '{0}'")]
    IndexNotLoaded(PathBuf),
}

impl DatastoreError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Incompatible {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Result type for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;
