//! Platform presets and export setting resolution.

use vgen_models::encoding::{DEFAULT_CRF, DEFAULT_FPS, DEFAULT_PRESET};
use vgen_models::{CropOverride, ExportPayload, ExportVariant, PlatformPreset, Resolution};

use crate::error::{MediaError, MediaResult};

/// Fully resolved export settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProfile {
    pub variant: ExportVariant,
    /// Target frame size; `None` keeps the source size (passthrough only)
    pub resolution: Option<Resolution>,
    pub fps: u32,
    pub crf: u8,
    pub preset: String,
    pub crop: Option<CropOverride>,
}

impl ExportProfile {
    /// Canonical settings for a platform.
    pub fn for_platform(platform: PlatformPreset) -> Self {
        let (variant, resolution, fps, crf) = match platform {
            PlatformPreset::TikTok | PlatformPreset::InstagramReels => (
                ExportVariant::GuaranteedUpright,
                Resolution::FULL_HD_PORTRAIT,
                30,
                23,
            ),
            PlatformPreset::YoutubeShorts => (
                ExportVariant::GuaranteedUpright,
                Resolution::FULL_HD_PORTRAIT,
                30,
                21,
            ),
            PlatformPreset::Youtube => (
                ExportVariant::HorizontalPassthrough,
                Resolution::FULL_HD,
                30,
                20,
            ),
            PlatformPreset::Twitter => (
                ExportVariant::HorizontalPassthrough,
                Resolution::HD,
                30,
                23,
            ),
        };

        Self {
            variant,
            resolution: Some(resolution),
            fps,
            crf,
            preset: DEFAULT_PRESET.to_string(),
            crop: None,
        }
    }

    /// Platform preset first, then explicit payload fields on top.
    pub fn resolve(payload: &ExportPayload) -> MediaResult<Self> {
        let mut profile = match (payload.platform, payload.variant) {
            (Some(platform), _) => Self::for_platform(platform),
            (None, Some(variant)) => Self::defaults(variant),
            (None, None) => {
                return Err(MediaError::profile(
                    "export needs a variant or a platform preset",
                ))
            }
        };

        if let Some(variant) = payload.variant {
            profile.variant = variant;
        }
        if payload.resolution.is_some() {
            profile.resolution = payload.resolution;
        }
        if let Some(fps) = payload.fps {
            profile.fps = fps;
        }
        if let Some(crf) = payload.crf {
            profile.crf = crf;
        }
        if let Some(preset) = &payload.preset {
            profile.preset = preset.clone();
        }
        profile.crop = payload.crop;

        Ok(profile)
    }

    fn defaults(variant: ExportVariant) -> Self {
        let resolution = match variant {
            ExportVariant::HorizontalPassthrough => None,
            _ => Some(Resolution::FULL_HD_PORTRAIT),
        };
        Self {
            variant,
            resolution,
            fps: DEFAULT_FPS,
            crf: DEFAULT_CRF,
            preset: DEFAULT_PRESET.to_string(),
            crop: None,
        }
    }
}
