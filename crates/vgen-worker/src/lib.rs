//! Generation and export workers.
//!
//! This crate provides:
//! - A worker pool that claims jobs, heartbeats them and records outcomes
//! - The generation handler (render submit, poll, store)
//! - The export handler (download, transcode, store)
//! - Job-scoped logging, retry helpers and metrics

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod export;
pub mod generation;
pub mod logging;
pub mod metrics;
pub mod records;
pub mod retry;

pub use config::WorkerConfig;
pub use context::JobContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobHandler, JobOutcome, PoolConfig, WorkerPool};
pub use export::ExportWorker;
pub use generation::{scale_render_progress, GenerationWorker};
pub use logging::JobLogger;
pub use records::{InMemoryRecords, JobStatusUpdate, MediaRecords};
pub use retry::{retry_async, FailureTracker, RetryConfig};
