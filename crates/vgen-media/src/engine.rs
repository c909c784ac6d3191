//! Transcoding engine: one export variant per invocation.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};
use vgen_models::encoding::DEFAULT_TRANSCODE_TIMEOUT_SECS;
use vgen_models::{CropOverride, ExportVariant, MediaInfo, Resolution};

use crate::command::FfmpegRunner;
use crate::error::{MediaError, MediaResult};
use crate::presets::ExportProfile;
use crate::probe::probe_media;
use crate::thumbnail::generate_thumbnail;
use crate::variant::VariantArgs;

pub const TRANSCODE_DURATION_SECONDS: &str = "vgen_transcode_duration_seconds";
pub const TRANSCODES_TOTAL: &str = "vgen_transcodes_total";

/// One transcode invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub variant: ExportVariant,
    pub resolution: Option<Resolution>,
    pub fps: u32,
    pub crf: u8,
    pub preset: String,
    pub crop: Option<CropOverride>,
    pub timeout: Duration,
}

impl TranscodeRequest {
    pub fn from_profile(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        profile: &ExportProfile,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            variant: profile.variant,
            resolution: profile.resolution,
            fps: profile.fps,
            crf: profile.crf,
            preset: profile.preset.clone(),
            crop: profile.crop,
            timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn profile(&self) -> ExportProfile {
        ExportProfile {
            variant: self.variant,
            resolution: self.resolution,
            fps: self.fps,
            crf: self.crf,
            preset: self.preset.clone(),
            crop: self.crop,
        }
    }
}

/// Outcome of a transcode invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscodeResult {
    pub success: bool,
    pub input_metadata: Option<MediaInfo>,
    pub output_metadata: Option<MediaInfo>,
    /// Equivalent shell command
    pub command_line: String,
    pub elapsed: Duration,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    /// The process was killed after exceeding its time limit
    pub timed_out: bool,
}

impl TranscodeResult {
    fn failed(error: &MediaError, elapsed: Duration) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            timed_out: matches!(error, MediaError::Timeout(_)),
            elapsed,
            ..Default::default()
        }
    }
}

/// Media operations used by the workers.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run one export variant. Failures are reported in the result, never raised.
    async fn process(&self, request: &TranscodeRequest) -> TranscodeResult;

    async fn probe(&self, path: &Path) -> MediaResult<MediaInfo>;

    async fn thumbnail(&self, video: &Path, output: &Path) -> MediaResult<()>;
}

/// [`Transcoder`] backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    thumbnail_timeout: Duration,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self {
            thumbnail_timeout: Duration::from_secs(60),
        }
    }
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thumbnail_timeout(mut self, timeout: Duration) -> Self {
        self.thumbnail_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn process(&self, request: &TranscodeRequest) -> TranscodeResult {
        let started = Instant::now();
        let variant = request.variant.as_str();

        let input_metadata = match probe_media(&request.input).await {
            Ok(info) => Some(info),
            // Stream copy does not need source geometry
            Err(e) if request.variant == ExportVariant::MetadataRotate => {
                warn!(input = %request.input.display(), error = %e, "Input probe failed");
                None
            }
            Err(e) => {
                record(variant, "failed", started.elapsed());
                return TranscodeResult::failed(&e, started.elapsed());
            }
        };

        let source = input_metadata
            .as_ref()
            .map(|info| Resolution::new(info.width, info.height))
            .unwrap_or_default();

        let args = match VariantArgs::plan(&request.profile(), source) {
            Ok(args) => args,
            Err(e) => {
                record(variant, "failed", started.elapsed());
                return TranscodeResult {
                    input_metadata,
                    ..TranscodeResult::failed(&e, started.elapsed())
                };
            }
        };

        let mut warnings = args.warnings();
        let command = args.into_command(&request.input, &request.output);
        let command_line = command.command_line();

        if let Some(parent) = request.output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let e = MediaError::from(e);
                record(variant, "failed", started.elapsed());
                return TranscodeResult {
                    input_metadata,
                    command_line,
                    ..TranscodeResult::failed(&e, started.elapsed())
                };
            }
        }

        info!(variant, command = %command_line, "Starting transcode");

        let total_secs = input_metadata.as_ref().map(|i| i.duration_secs).unwrap_or(0.0);
        let run = FfmpegRunner::new()
            .with_timeout(request.timeout)
            .run_with_progress(&command, move |progress| {
                debug!(
                    percent = progress.percentage(total_secs),
                    speed = progress.speed,
                    "Transcode progress"
                );
            })
            .await;

        if let Err(e) = run {
            let elapsed = started.elapsed();
            warn!(variant, error = %e, elapsed_ms = elapsed.as_millis() as u64, "Transcode failed");
            record(variant, "failed", elapsed);
            return TranscodeResult {
                input_metadata,
                command_line,
                warnings,
                ..TranscodeResult::failed(&e, elapsed)
            };
        }

        let output_metadata = match probe_media(&request.output).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(output = %request.output.display(), error = %e, "Output probe failed");
                warnings.push(format!("output metadata unavailable: {}", e));
                None
            }
        };

        let elapsed = started.elapsed();
        record(variant, "success", elapsed);
        info!(variant, elapsed_ms = elapsed.as_millis() as u64, "Transcode finished");

        TranscodeResult {
            success: true,
            input_metadata,
            output_metadata,
            command_line,
            elapsed,
            warnings,
            error: None,
            timed_out: false,
        }
    }

    async fn probe(&self, path: &Path) -> MediaResult<MediaInfo> {
        probe_media(path).await
    }

    async fn thumbnail(&self, video: &Path, output: &Path) -> MediaResult<()> {
        generate_thumbnail(video, output, self.thumbnail_timeout).await
    }
}

fn record(variant: &'static str, status: &'static str, elapsed: Duration) {
    let labels = [("variant", variant), ("status", status)];
    counter!(TRANSCODES_TOTAL, &labels).increment(1);
    histogram!(TRANSCODE_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
}
