//! Shared data models for the video generation pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their state machine
//! - Generation and export payloads
//! - Media records and probed media information
//! - Encoding defaults

pub mod encoding;
pub mod job;
pub mod media;
pub mod payload;

// Re-export common types
pub use encoding::{AudioHandling, EncodingConfig};
pub use job::{
    Job, JobId, JobKind, JobOutput, JobStatus, TransitionError, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_PRIORITY, HIGH_PRIORITY, MAX_PRIORITY,
};
pub use media::{MediaId, MediaInfo, MediaKind, MediaRecord, MediaStatus};
pub use payload::{
    AspectRatio, CropOverride, ExportPayload, ExportVariant, GenerationMode, GenerationPayload,
    JobPayload, PayloadError, PlatformPreset, Resolution,
};
