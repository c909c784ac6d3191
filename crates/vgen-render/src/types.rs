//! Wire types for the render service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use vgen_models::{AspectRatio, GenerationMode, GenerationPayload, Resolution};

/// Inline reference image for image-to-video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextImage {
    pub mime_type: String,
    /// Base64 (standard alphabet) image bytes
    pub data: String,
}

impl ContextImage {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        }
    }
}

/// Body of `POST {base}/operations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub prompt: String,
    pub mode: GenerationMode,
    pub duration_secs: u32,
    pub resolution: Resolution,
    pub aspect_ratio: AspectRatio,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ContextImage>,
}

impl RenderRequest {
    pub fn from_payload(payload: &GenerationPayload) -> Self {
        Self {
            prompt: payload.prompt.clone(),
            mode: payload.mode,
            duration_secs: payload.duration_secs,
            resolution: payload.resolution,
            aspect_ratio: payload.aspect_ratio,
            model: payload.model.clone(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ContextImage) -> Self {
        self.image = Some(image);
        self
    }
}

/// Identifier of a submitted long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    #[serde(alias = "name", alias = "id")]
    pub operation_id: String,
}

/// Output of a finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Absolute URL, or a path relative to the service base URL
    #[serde(alias = "uri")]
    pub video_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Failure reported by the service inside a status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub permanent: bool,
}

/// Body of `GET {base}/operations/{id}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(default)]
    pub done: bool,
    /// 0-100 when the service reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationStatus {
    pub fn in_progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Default::default()
        }
    }

    pub fn succeeded(result: OperationResult) -> Self {
        Self {
            done: true,
            progress: Some(100),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, permanent: bool) -> Self {
        Self {
            done: true,
            error: Some(OperationError {
                message: message.into(),
                code: None,
                permanent,
            }),
            ..Default::default()
        }
    }
}
