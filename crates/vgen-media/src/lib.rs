//! FFmpeg CLI wrapper for the export pipeline.
//!
//! This crate provides:
//! - FFmpeg command building and execution with timeout and progress
//! - FFprobe media information
//! - The four export variants and their geometry
//! - Platform presets and thumbnail generation

pub mod command;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod presets;
pub mod probe;
pub mod progress;
pub mod thumbnail;
pub mod variant;

pub use command::{check_ffmpeg, check_ffprobe, shell_quote, FfmpegCommand, FfmpegRunner};
pub use engine::{FfmpegTranscoder, TranscodeRequest, TranscodeResult, Transcoder};
pub use error::{MediaError, MediaResult};
pub use geometry::{CropBox, ScalePadGeometry};
pub use presets::ExportProfile;
pub use probe::probe_media;
pub use progress::FfmpegProgress;
pub use thumbnail::generate_thumbnail;
pub use variant::{VariantArgs, METADATA_ROTATE_WARNING};
