//! Media records and probed media information.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

/// Unique identifier for a stored media file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MediaId(pub String);

impl MediaId {
    /// Generate a new random media ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MediaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MediaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a media file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Output of a generation job
    Generated,
    /// Output of an export job
    Export,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Generated => "generated",
            MediaKind::Export => "export",
        }
    }
}

/// Media lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    #[default]
    Processing,
    Ready,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Processing => "processing",
            MediaStatus::Ready => "ready",
            MediaStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Probed stream information for a video file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct MediaInfo {
    /// Duration in seconds
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    /// Frame rate rounded to the nearest integer
    pub fps: u32,
    /// Video codec name
    pub codec: String,
    pub has_audio: bool,
    #[serde(default)]
    pub size_bytes: u64,
}

impl MediaInfo {
    /// Width divided by height (0 when height is unknown).
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            f64::from(self.width) / f64::from(self.height)
        }
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

/// Media record kept by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MediaRecord {
    pub media_id: MediaId,

    pub kind: MediaKind,

    #[serde(default)]
    pub status: MediaStatus,

    /// Object key / path in storage
    pub storage_path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaInfo>,

    /// Warnings reported while producing the file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Source media for exports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_media_id: Option<MediaId>,

    /// Job that produced the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaRecord {
    /// Create a ready record for a freshly stored file.
    pub fn new(kind: MediaKind, storage_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            media_id: MediaId::new(),
            kind,
            status: MediaStatus::Ready,
            storage_path: storage_path.into(),
            public_url: None,
            thumbnail_path: None,
            metadata: None,
            warnings: Vec::new(),
            source_media_id: None,
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, media_id: MediaId) -> Self {
        self.media_id = media_id;
        self
    }

    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url;
        self
    }

    pub fn with_thumbnail(mut self, path: Option<String>) -> Self {
        self.thumbnail_path = path;
        self
    }

    pub fn with_metadata(mut self, info: Option<MediaInfo>) -> Self {
        self.metadata = info;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_source(mut self, source: MediaId) -> Self {
        self.source_media_id = Some(source);
        self
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_status(mut self, status: MediaStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.status == MediaStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builders() {
        let record = MediaRecord::new(MediaKind::Export, "exports/a.mp4")
            .with_source(MediaId::from("src"))
            .with_warnings(vec!["rotation flag only".to_string()]);

        assert!(record.is_ready());
        assert_eq!(record.source_media_id, Some(MediaId::from("src")));
        assert_eq!(record.warnings.len(), 1);

        let processing = record.with_status(MediaStatus::Processing);
        assert!(!processing.is_ready());
    }

    #[test]
    fn test_media_info_orientation() {
        let info = MediaInfo {
            width: 1080,
            height: 1920,
            ..Default::default()
        };
        assert!(info.is_portrait());
        assert!((info.aspect_ratio() - 0.5625).abs() < 1e-9);
        assert_eq!(MediaInfo::default().aspect_ratio(), 0.0);
    }

    #[test]
    fn test_record_serialization_skips_empty_fields() {
        let record = MediaRecord::new(MediaKind::Generated, "generated/a.mp4");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "generated");
        assert_eq!(json["status"], "ready");
        assert!(json.get("warnings").is_none());
        assert!(json.get("public_url").is_none());
    }
}
