//! Encoder settings shared by the export variants.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";
pub const DEFAULT_PRESET: &str = "fast";
pub const DEFAULT_CRF: u8 = 23;
/// libx264 rejects anything above this
pub const MAX_CRF: u8 = 51;
pub const DEFAULT_FPS: u32 = 30;
/// Letterbox fill for scale-pad exports
pub const DEFAULT_PAD_COLOR: &str = "black";
/// Wall-clock limit for one FFmpeg run
pub const DEFAULT_TRANSCODE_TIMEOUT_SECS: u64 = 600;

pub const THUMBNAIL_SCALE_WIDTH: u32 = 480;
pub const THUMBNAIL_TIMESTAMP: &str = "00:00:01";

/// What happens to the source audio track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AudioHandling {
    /// Stream-copy the track untouched
    Copy,
    Encode { codec: String, bitrate: String },
}

impl Default for AudioHandling {
    fn default() -> Self {
        AudioHandling::Encode {
            codec: DEFAULT_AUDIO_CODEC.to_string(),
            bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
        }
    }
}

/// Video re-encode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EncodingConfig {
    pub codec: String,
    pub preset: String,
    /// 0-51, lower is better
    pub crf: u8,
    pub audio: AudioHandling,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: DEFAULT_VIDEO_CODEC.to_string(),
            preset: DEFAULT_PRESET.to_string(),
            crf: DEFAULT_CRF,
            audio: AudioHandling::default(),
        }
    }
}

impl EncodingConfig {
    /// CRF is capped at [`MAX_CRF`].
    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf.min(MAX_CRF);
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_audio_copy(mut self) -> Self {
        self.audio = AudioHandling::Copy;
        self
    }

    /// Output-side codec arguments.
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-c:v", self.codec.as_str(), "-preset", self.preset.as_str(), "-crf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(self.crf.to_string());

        match &self.audio {
            AudioHandling::Copy => args.extend(["-c:a".to_string(), "copy".to_string()]),
            AudioHandling::Encode { codec, bitrate } => args.extend([
                "-c:a".to_string(),
                codec.clone(),
                "-b:a".to_string(),
                bitrate.clone(),
            ]),
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reencode_args() {
        let args = EncodingConfig::default().to_ffmpeg_args();
        assert_eq!(
            args,
            vec!["-c:v", "libx264", "-preset", "fast", "-crf", "23", "-c:a", "aac", "-b:a", "128k"]
        );
    }

    #[test]
    fn test_crf_capped_and_audio_copied() {
        let config = EncodingConfig::default().with_crf(80).with_audio_copy();
        assert_eq!(config.crf, MAX_CRF);
        let args = config.to_ffmpeg_args();
        assert!(args.ends_with(&["-c:a".to_string(), "copy".to_string()]));
        assert!(!args.contains(&"aac".to_string()));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EncodingConfig = serde_json::from_str(r#"{"crf": 18}"#).unwrap();
        assert_eq!(config.crf, 18);
        assert_eq!(config.preset, "fast");
        assert_eq!(config.audio, AudioHandling::default());
    }
}
