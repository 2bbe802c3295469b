use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Upload failed: {0}")]
    PermanentUpload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::TransientNetwork(_))
    }
}

/// Maps an HTTP status returned by a vendor API onto the error taxonomy.
pub fn classify_status(status: u16, message: impl Into<String>) -> StorageError {
    let message = message.into();
    match status {
        401 | 403 => StorageError::Authentication(message),
        408 | 429 | 500..=599 => StorageError::TransientNetwork(message),
        _ => StorageError::PermanentUpload(message),
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
