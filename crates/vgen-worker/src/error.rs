//! Worker error types.

use thiserror::Error;
use vgen_media::MediaError;
use vgen_queue::QueueError;
use vgen_render::{PollError, RenderError};
use vgen_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Source media not found: {0}")]
    SourceNotFound(String),

    #[error("Source media not ready: {0}")]
    SourceNotReady(String),

    #[error("Transcode failed: {message}")]
    TranscodeFailed { message: String, timed_out: bool },

    #[error("Record store error: {0}")]
    Records(String),

    #[error("Render polling failed: {0}")]
    Poll(#[from] PollError),

    #[error("Render service error: {0}")]
    Render(#[from] RenderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn records(msg: impl Into<String>) -> Self {
        Self::Records(msg.into())
    }

    /// Transient failures that may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::TranscodeFailed { timed_out, .. } => *timed_out,
            WorkerError::Render(e) => e.is_retryable(),
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Media(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::Poll(PollError::TooManyErrors { .. }) => true,
            WorkerError::Io(_) => true,
            _ => false,
        }
    }

    /// Failures where retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        match self {
            WorkerError::Cancelled
            | WorkerError::InvalidPayload(_)
            | WorkerError::SourceNotFound(_)
            | WorkerError::SourceNotReady(_) => true,
            WorkerError::Render(e) => e.is_permanent(),
            WorkerError::Poll(PollError::OperationFailed { permanent, .. }) => *permanent,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}
