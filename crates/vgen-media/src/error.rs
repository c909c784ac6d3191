//! Errors raised by the transcoding engine.

use std::path::PathBuf;
use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    /// `ffmpeg` or `ffprobe` is not on PATH
    #[error("{0} is not installed or not on PATH")]
    ToolMissing(&'static str),

    #[error("ffmpeg exited unsuccessfully: {message}")]
    FfmpegFailed {
        message: String,
        /// Tail of stderr, when captured
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("could not probe {path}: {message}")]
    ProbeFailed { path: PathBuf, message: String },

    #[error("input does not exist: {0}")]
    InputMissing(PathBuf),

    #[error("{0} has no video stream")]
    NoVideoStream(String),

    #[error("transcode exceeded {0}s and was killed")]
    Timeout(u64),

    #[error("unusable geometry: {0}")]
    InvalidGeometry(String),

    #[error("export profile error: {0}")]
    Profile(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed ffprobe output: {0}")]
    ProbeOutput(#[from] serde_json::Error),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry(message.into())
    }

    pub fn profile(message: impl Into<String>) -> Self {
        Self::Profile(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// A timed-out or I/O-interrupted transcode may succeed when rerun.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MediaError::Timeout(_) | MediaError::Io(_))
    }
}
