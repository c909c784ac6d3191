//! Render client error types.

use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    /// The service rejected the operation; retrying cannot help.
    #[error("Operation rejected: {0}")]
    Permanent(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::ServiceUnavailable(_)
                | RenderError::Timeout(_)
                | RenderError::Network(_)
                | RenderError::Io(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, RenderError::Permanent(_))
    }
}
