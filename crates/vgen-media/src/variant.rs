//! Typed FFmpeg argument builders, one per export variant.

use std::path::Path;

use vgen_models::encoding::DEFAULT_PAD_COLOR;
use vgen_models::{EncodingConfig, ExportVariant, Resolution};

use crate::command::FfmpegCommand;
use crate::error::MediaResult;
use crate::geometry::{cover_filter, CropBox, ScalePadGeometry};
use crate::presets::ExportProfile;

/// Warning attached to every metadata-only rotation.
pub const METADATA_ROTATE_WARNING: &str =
    "metadata-rotate only sets a display rotation flag; some players ignore it and show the video sideways";

/// Stream copy with a rotation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRotateArgs {
    pub degrees: u32,
}

impl MetadataRotateArgs {
    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.stream_copy()
            .video_stream_metadata("rotate", self.degrees)
    }
}

/// Crop in source space, transpose, then cover the exact target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuaranteedUprightArgs {
    pub crop: CropBox,
    pub target: Resolution,
    pub fps: u32,
    pub encoding: EncodingConfig,
}

impl GuaranteedUprightArgs {
    pub fn filter(&self) -> String {
        format!(
            "{},transpose=1,{},setsar=1",
            self.crop.filter(),
            cover_filter(self.target)
        )
    }

    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.video_filter(self.filter())
            .frame_rate(self.fps)
            .encoding(&self.encoding)
    }
}

/// Transpose, fit inside the target and letterbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePadArgs {
    pub geometry: ScalePadGeometry,
    pub color: String,
    pub fps: u32,
    pub encoding: EncodingConfig,
}

impl ScalePadArgs {
    pub fn filter(&self) -> String {
        format!("transpose=1,{}", self.geometry.filter(&self.color))
    }

    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.video_filter(self.filter())
            .frame_rate(self.fps)
            .encoding(&self.encoding)
    }
}

/// No rotation; optional fit to a different canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorizontalPassthroughArgs {
    pub fit: Option<ScalePadGeometry>,
    pub fps: u32,
    pub encoding: EncodingConfig,
}

impl HorizontalPassthroughArgs {
    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        let cmd = match &self.fit {
            Some(fit) => cmd.video_filter(fit.filter(DEFAULT_PAD_COLOR)),
            None => cmd,
        };
        cmd.frame_rate(self.fps).encoding(&self.encoding)
    }
}

/// Arguments for one export, by variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantArgs {
    MetadataRotate(MetadataRotateArgs),
    GuaranteedUpright(GuaranteedUprightArgs),
    ScalePad(ScalePadArgs),
    HorizontalPassthrough(HorizontalPassthroughArgs),
}

impl VariantArgs {
    /// Compute the arguments for `profile` applied to a source of `source` dimensions.
    pub fn plan(profile: &ExportProfile, source: Resolution) -> MediaResult<Self> {
        let encoding = EncodingConfig::default()
            .with_crf(profile.crf)
            .with_preset(profile.preset.clone());
        let target = profile.resolution.unwrap_or(Resolution::FULL_HD_PORTRAIT);

        let args = match profile.variant {
            ExportVariant::MetadataRotate => {
                VariantArgs::MetadataRotate(MetadataRotateArgs { degrees: 90 })
            }
            ExportVariant::GuaranteedUpright => {
                VariantArgs::GuaranteedUpright(GuaranteedUprightArgs {
                    crop: CropBox::centered(source, target, profile.crop)?,
                    target,
                    fps: profile.fps,
                    encoding: encoding.with_audio_copy(),
                })
            }
            ExportVariant::ScalePad => VariantArgs::ScalePad(ScalePadArgs {
                geometry: ScalePadGeometry::fit(source.swapped(), target)?,
                color: DEFAULT_PAD_COLOR.to_string(),
                fps: profile.fps,
                encoding,
            }),
            ExportVariant::HorizontalPassthrough => {
                let fit = match profile.resolution {
                    Some(res) if res != source => Some(ScalePadGeometry::fit(source, res)?),
                    _ => None,
                };
                VariantArgs::HorizontalPassthrough(HorizontalPassthroughArgs {
                    fit,
                    fps: profile.fps,
                    encoding,
                })
            }
        };

        Ok(args)
    }

    pub fn variant(&self) -> ExportVariant {
        match self {
            VariantArgs::MetadataRotate(_) => ExportVariant::MetadataRotate,
            VariantArgs::GuaranteedUpright(_) => ExportVariant::GuaranteedUpright,
            VariantArgs::ScalePad(_) => ExportVariant::ScalePad,
            VariantArgs::HorizontalPassthrough(_) => ExportVariant::HorizontalPassthrough,
        }
    }

    /// Add this variant's filters and codec settings to `cmd`.
    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        match self {
            VariantArgs::MetadataRotate(a) => a.apply(cmd),
            VariantArgs::GuaranteedUpright(a) => a.apply(cmd),
            VariantArgs::ScalePad(a) => a.apply(cmd),
            VariantArgs::HorizontalPassthrough(a) => a.apply(cmd),
        }
    }

    /// Warnings known before running FFmpeg.
    pub fn warnings(&self) -> Vec<String> {
        match self {
            VariantArgs::MetadataRotate(_) => vec![METADATA_ROTATE_WARNING.to_string()],
            _ => Vec::new(),
        }
    }

    pub fn into_command(self, input: &Path, output: &Path) -> FfmpegCommand {
        self.apply(FfmpegCommand::new(input, output)).faststart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgen_models::{CropOverride, ExportPayload, PlatformPreset};

    fn profile(variant: ExportVariant) -> ExportProfile {
        ExportProfile::resolve(&ExportPayload::new("m1", variant)).unwrap()
    }

    fn output_args(args: &VariantArgs) -> Vec<String> {
        args.apply(FfmpegCommand::new("in.mp4", "out.mp4"))
            .output_arguments()
            .to_vec()
    }

    #[test]
    fn test_metadata_rotate_args() {
        let args = VariantArgs::plan(&profile(ExportVariant::MetadataRotate), Resolution::FULL_HD).unwrap();
        assert_eq!(
            output_args(&args),
            vec!["-c", "copy", "-metadata:s:v:0", "rotate=90"]
        );
        assert_eq!(args.warnings(), vec![METADATA_ROTATE_WARNING.to_string()]);
    }

    #[test]
    fn test_guaranteed_upright_args() {
        let args =
            VariantArgs::plan(&profile(ExportVariant::GuaranteedUpright), Resolution::FULL_HD).unwrap();
        let out = output_args(&args);
        assert_eq!(out[0], "-vf");
        assert_eq!(
            out[1],
            "crop=1080:1080:420:0,transpose=1,scale=1080:1920:force_original_aspect_ratio=increase,crop=1080:1920,setsar=1"
        );
        assert!(out.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(out.windows(2).any(|w| w == ["-r", "30"]));
        assert!(out.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(args.warnings().is_empty());
    }

    #[test]
    fn test_guaranteed_upright_uses_fps_override() {
        let payload = ExportPayload::for_platform("m1", PlatformPreset::TikTok).with_fps(60);
        let p = ExportProfile::resolve(&payload).unwrap();
        assert_eq!(p.variant, ExportVariant::GuaranteedUpright);

        let args = VariantArgs::plan(&p, Resolution::FULL_HD).unwrap();
        let out = output_args(&args);
        assert!(out.windows(2).any(|w| w == ["-r", "60"]), "{:?}", out);
        assert!(!out.windows(2).any(|w| w == ["-r", "30"]));
    }

    #[test]
    fn test_into_command_ends_with_faststart() {
        let cmd = VariantArgs::plan(&profile(ExportVariant::MetadataRotate), Resolution::FULL_HD)
            .unwrap()
            .into_command(Path::new("in.mp4"), Path::new("out.mp4"));
        let args = cmd.build_args();
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart"]));
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn test_guaranteed_upright_respects_crop_override() {
        let mut p = profile(ExportVariant::GuaranteedUpright);
        p.crop = Some(CropOverride { x: 0, y: 0 });
        let VariantArgs::GuaranteedUpright(args) = VariantArgs::plan(&p, Resolution::FULL_HD).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(args.crop.x, 0);
    }

    #[test]
    fn test_scale_pad_args() {
        let mut p = profile(ExportVariant::ScalePad);
        p.resolution = Some(Resolution::FULL_HD);
        let out = output_args(&VariantArgs::plan(&p, Resolution::FULL_HD).unwrap());
        assert_eq!(
            out[1],
            "transpose=1,scale=606:1080,pad=1920:1080:657:0:color=black,setsar=1"
        );
        assert!(out.windows(2).any(|w| w == ["-r", "30"]));
        assert!(out.windows(2).any(|w| w == ["-c:a", "aac"]));
    }

    #[test]
    fn test_passthrough_args() {
        let out = output_args(
            &VariantArgs::plan(&profile(ExportVariant::HorizontalPassthrough), Resolution::FULL_HD)
                .unwrap(),
        );
        assert!(!out.contains(&"-vf".to_string()));
        assert_eq!(&out[..2], &["-r", "30"]);
        assert!(out.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(out.windows(2).any(|w| w == ["-c:a", "aac"]));

        let mut p = profile(ExportVariant::HorizontalPassthrough);
        p.resolution = Some(Resolution::HD);
        let out = output_args(&VariantArgs::plan(&p, Resolution::FULL_HD).unwrap());
        assert_eq!(out[1], "scale=1280:720,pad=1280:720:0:0:color=black,setsar=1");
    }

    #[test]
    fn test_plan_is_deterministic() {
        let p = profile(ExportVariant::GuaranteedUpright);
        assert_eq!(
            VariantArgs::plan(&p, Resolution::FULL_HD).unwrap(),
            VariantArgs::plan(&p, Resolution::FULL_HD).unwrap()
        );
    }
}
