//! Errors returned by queue backends and the queue manager.

use thiserror::Error;
use vgen_models::{PayloadError, TransitionError};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unreachable: {0}")]
    ConnectionFailed(String),

    #[error("could not enqueue job: {0}")]
    EnqueueFailed(String),

    #[error("no job {0} in this queue")]
    JobNotFound(String),

    #[error("rejected payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn not_found(job_id: impl std::fmt::Display) -> Self {
        Self::JobNotFound(job_id.to_string())
    }

    /// Transport-level failures; everything else is a caller or state error.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) => true,
            QueueError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}
