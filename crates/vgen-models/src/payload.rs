//! Generation and export job payloads.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::job::JobKind;

/// Payload validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("image-to-video generation requires context media")]
    MissingContextMedia,

    #[error("export requires a variant or a platform preset")]
    MissingVariant,

    #[error("invalid resolution '{0}', expected WIDTHxHEIGHT")]
    InvalidResolution(String),

    #[error("unknown export variant '{0}'")]
    UnknownVariant(String),
}

impl From<validator::ValidationErrors> for PayloadError {
    fn from(errors: validator::ValidationErrors) -> Self {
        PayloadError::Invalid(errors.to_string())
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FULL_HD: Resolution = Resolution::new(1920, 1080);
    pub const FULL_HD_PORTRAIT: Resolution = Resolution::new(1080, 1920);
    pub const HD: Resolution = Resolution::new(1280, 720);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same frame rotated by 90 degrees.
    pub fn swapped(self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FULL_HD
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PayloadError::InvalidResolution(s.to_string());
        let (w, h) = s
            .trim()
            .split_once(['x', 'X', ':'])
            .ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

/// How a video is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    TextToVideo,
    ImageToVideo,
}

/// Requested aspect ratio of a generated video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Square => "1:1",
        }
    }
}

/// Parameters for a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct GenerationPayload {
    /// Text prompt sent to the render service
    #[validate(length(min = 1, max = 4000))]
    pub prompt: String,

    #[serde(default)]
    pub mode: GenerationMode,

    /// Requested clip length
    #[validate(range(min = 1, max = 60))]
    pub duration_secs: u32,

    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub aspect_ratio: AspectRatio,

    /// Storage path of the reference image (image-to-video)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_media: Option<String>,

    /// Render model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Requesting user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl GenerationPayload {
    /// Text-to-video payload with default resolution and aspect ratio.
    pub fn new(prompt: impl Into<String>, duration_secs: u32) -> Self {
        Self {
            prompt: prompt.into(),
            mode: GenerationMode::TextToVideo,
            duration_secs,
            resolution: Resolution::default(),
            aspect_ratio: AspectRatio::default(),
            context_media: None,
            model: None,
            owner: None,
        }
    }

    /// Switch to image-to-video with the given reference image.
    pub fn with_context_media(mut self, path: impl Into<String>) -> Self {
        self.mode = GenerationMode::ImageToVideo;
        self.context_media = Some(path.into());
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn check(&self) -> Result<(), PayloadError> {
        self.validate()?;
        if self.prompt.trim().is_empty() {
            return Err(PayloadError::Invalid("prompt must not be blank".to_string()));
        }
        let has_context = self
            .context_media
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if self.mode == GenerationMode::ImageToVideo && !has_context {
            return Err(PayloadError::MissingContextMedia);
        }
        Ok(())
    }
}

/// Export variant executed by the transcoding engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExportVariant {
    /// Stream copy with a rotation flag; no re-encode
    #[serde(alias = "rotate")]
    MetadataRotate,
    /// Crop, transpose and re-encode to an upright frame
    #[serde(alias = "upright")]
    GuaranteedUpright,
    /// Transpose, fit and letterbox to the target canvas
    #[serde(alias = "pad")]
    ScalePad,
    /// No rotation; re-encode at the target frame rate
    #[serde(alias = "passthrough", alias = "horizontal")]
    HorizontalPassthrough,
}

impl ExportVariant {
    pub const ALL: [ExportVariant; 4] = [
        ExportVariant::MetadataRotate,
        ExportVariant::GuaranteedUpright,
        ExportVariant::ScalePad,
        ExportVariant::HorizontalPassthrough,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportVariant::MetadataRotate => "metadata-rotate",
            ExportVariant::GuaranteedUpright => "guaranteed-upright",
            ExportVariant::ScalePad => "scale-pad",
            ExportVariant::HorizontalPassthrough => "horizontal-passthrough",
        }
    }
}

impl fmt::Display for ExportVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportVariant {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "metadata-rotate" | "rotate" => Ok(ExportVariant::MetadataRotate),
            "guaranteed-upright" | "upright" => Ok(ExportVariant::GuaranteedUpright),
            "scale-pad" | "pad" => Ok(ExportVariant::ScalePad),
            "horizontal-passthrough" | "passthrough" | "horizontal" => {
                Ok(ExportVariant::HorizontalPassthrough)
            }
            _ => Err(PayloadError::UnknownVariant(s.to_string())),
        }
    }
}

/// Explicit crop origin in source (pre-rotation) pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CropOverride {
    pub x: u32,
    pub y: u32,
}

/// Named export targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPreset {
    #[serde(alias = "tiktok")]
    TikTok,
    InstagramReels,
    YoutubeShorts,
    Youtube,
    Twitter,
}

impl PlatformPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformPreset::TikTok => "tik_tok",
            PlatformPreset::InstagramReels => "instagram_reels",
            PlatformPreset::YoutubeShorts => "youtube_shorts",
            PlatformPreset::Youtube => "youtube",
            PlatformPreset::Twitter => "twitter",
        }
    }
}

/// Parameters for an export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ExportPayload {
    /// Media record to export
    #[validate(length(min = 1))]
    pub source_media_id: String,

    /// Variant; falls back to the platform preset's variant when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<ExportVariant>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    #[validate(range(min = 1, max = 120))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,

    #[validate(range(max = 51))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,

    /// x264 preset name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropOverride>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformPreset>,
}

impl ExportPayload {
    pub fn new(source_media_id: impl Into<String>, variant: ExportVariant) -> Self {
        Self {
            source_media_id: source_media_id.into(),
            variant: Some(variant),
            resolution: None,
            fps: None,
            crf: None,
            preset: None,
            crop: None,
            platform: None,
        }
    }

    /// Export driven entirely by a platform preset.
    pub fn for_platform(source_media_id: impl Into<String>, platform: PlatformPreset) -> Self {
        Self {
            variant: None,
            platform: Some(platform),
            ..Self::new(source_media_id, ExportVariant::HorizontalPassthrough)
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = Some(crf);
        self
    }

    pub fn with_crop(mut self, crop: CropOverride) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn check(&self) -> Result<(), PayloadError> {
        self.validate()?;
        if self.variant.is_none() && self.platform.is_none() {
            return Err(PayloadError::MissingVariant);
        }
        if let Some(res) = self.resolution {
            if res.width == 0 || res.height == 0 {
                return Err(PayloadError::InvalidResolution(res.to_string()));
            }
        }
        Ok(())
    }
}

/// Kind-specific job parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Generate(GenerationPayload),
    Export(ExportPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Generate(_) => JobKind::Generate,
            JobPayload::Export(_) => JobKind::Export,
        }
    }

    /// Validate field ranges and cross-field rules.
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            JobPayload::Generate(p) => p.check(),
            JobPayload::Export(p) => p.check(),
        }
    }

    pub fn as_generation(&self) -> Option<&GenerationPayload> {
        match self {
            JobPayload::Generate(p) => Some(p),
            JobPayload::Export(_) => None,
        }
    }

    pub fn as_export(&self) -> Option<&ExportPayload> {
        match self {
            JobPayload::Export(p) => Some(p),
            JobPayload::Generate(_) => None,
        }
    }
}

impl From<GenerationPayload> for JobPayload {
    fn from(p: GenerationPayload) -> Self {
        JobPayload::Generate(p)
    }
}

impl From<ExportPayload> for JobPayload {
    fn from(p: ExportPayload) -> Self {
        JobPayload::Export(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        assert_eq!(
            "1080x1920".parse::<Resolution>().unwrap(),
            Resolution::FULL_HD_PORTRAIT
        );
        assert_eq!(" 1280 X 720 ".parse::<Resolution>().unwrap(), Resolution::HD);
        assert!("1080".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert_eq!(Resolution::FULL_HD.swapped(), Resolution::FULL_HD_PORTRAIT);
    }

    #[test]
    fn test_generation_validation() {
        assert!(GenerationPayload::new("a lighthouse at dusk", 8).check().is_ok());
        assert!(GenerationPayload::new("", 8).check().is_err());
        assert!(GenerationPayload::new("ok", 0).check().is_err());
        assert!(GenerationPayload::new("ok", 61).check().is_err());

        let mut i2v = GenerationPayload::new("animate this", 5);
        i2v.mode = GenerationMode::ImageToVideo;
        assert_eq!(i2v.check(), Err(PayloadError::MissingContextMedia));
        assert!(i2v.with_context_media("uploads/ref.png").check().is_ok());

        let portrait = GenerationPayload::new("a heron", 5)
            .with_resolution(Resolution::FULL_HD_PORTRAIT)
            .with_aspect_ratio(AspectRatio::Portrait);
        assert!(portrait.check().is_ok());
        assert_eq!(serde_json::to_value(&portrait).unwrap()["aspect_ratio"], "9:16");
    }

    #[test]
    fn test_export_validation() {
        let payload = ExportPayload::new("media-1", ExportVariant::ScalePad).with_fps(30);
        assert!(payload.check().is_ok());
        assert!(payload.clone().with_fps(0).check().is_err());
        assert!(payload.clone().with_crf(52).check().is_err());

        let framed = payload
            .clone()
            .with_resolution(Resolution::FULL_HD_PORTRAIT)
            .with_crop(CropOverride { x: 100, y: 0 });
        assert!(framed.check().is_ok());
        assert_eq!(framed.crop, Some(CropOverride { x: 100, y: 0 }));

        let mut no_variant = payload;
        no_variant.variant = None;
        assert_eq!(no_variant.check(), Err(PayloadError::MissingVariant));

        assert!(ExportPayload::for_platform("media-1", PlatformPreset::TikTok)
            .check()
            .is_ok());
    }

    #[test]
    fn test_variant_names() {
        let json = serde_json::to_string(&ExportVariant::GuaranteedUpright).unwrap();
        assert_eq!(json, "\"guaranteed-upright\"");

        let parsed: ExportVariant = serde_json::from_str("\"pad\"").unwrap();
        assert_eq!(parsed, ExportVariant::ScalePad);

        for variant in ExportVariant::ALL {
            assert_eq!(variant.as_str().parse::<ExportVariant>().unwrap(), variant);
        }
        assert_eq!(
            "METADATA_ROTATE".parse::<ExportVariant>().unwrap(),
            ExportVariant::MetadataRotate
        );
        assert!("sideways".parse::<ExportVariant>().is_err());
    }

    #[test]
    fn test_payload_tagging() {
        let payload: JobPayload = GenerationPayload::new("a fox", 5).into();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "generate");
        assert_eq!(json["prompt"], "a fox");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), JobKind::Generate);
        assert!(back.as_generation().is_some());
        assert!(back.as_export().is_none());
    }
}
