//! Storage errors.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage misconfigured: {0}")]
    Misconfigured(String),

    #[error("no object at {0}")]
    NotFound(String),

    /// A put, get or delete against the backend failed
    #[error("{op} failed: {message}")]
    Transfer { op: &'static str, message: String },

    /// Keys are relative, `/`-separated and free of `..` segments
    #[error("rejected object key {0:?}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Misconfigured(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::transfer("upload", msg)
    }

    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::transfer("download", msg)
    }

    pub fn delete_failed(msg: impl Into<String>) -> Self {
        Self::transfer("delete", msg)
    }

    fn transfer(op: &'static str, msg: impl Into<String>) -> Self {
        Self::Transfer {
            op,
            message: msg.into(),
        }
    }

    /// Missing objects, bad keys and bad config fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transfer { .. } | StorageError::Io(_))
    }
}
