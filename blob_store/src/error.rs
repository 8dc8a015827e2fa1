//! Error types for blob store operations.

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob is stored under the key.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// The key could escape the storage root or is otherwise unusable.
    #[error("invalid blob key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Writing or removing the blob failed.
    #[error("failed to write blob {key}: {source}")]
    Write { key: String, source: anyhow::Error },

    /// Reading the blob failed for a reason other than absence.
    #[error("failed to read blob {key}: {source}")]
    Read { key: String, source: anyhow::Error },

    /// The storage root could not be opened.
    #[error("invalid blob storage path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    pub(crate) fn write(key: &str, err: impl Into<anyhow::Error>) -> Self {
        BlobError::Write {
            key: key.to_string(),
            source: err.into(),
        }
    }

    /// Maps an object_store read failure, keeping absence distinguishable.
    pub(crate) fn read(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.to_string(),
            },
            _ => BlobError::Read {
                key: key.to_string(),
                source: anyhow::Error::from(err),
            },
        }
    }
}
