//! Priority job queues for the generation and export pipelines.
//!
//! This crate provides:
//! - A Redis-backed queue shared across processes
//! - An in-memory queue for single-node deployments and tests
//! - A disabled queue that degrades every call to a logged no-op
//! - The queue manager: enqueue APIs, health, maintenance and shutdown

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;

pub use backend::{DisabledQueue, MemoryQueue, RedisQueue};
pub use config::{
    EnqueueOptions, QueueBackend, QueueConfig, QueueStats, RetentionPolicy, StalledReport,
};
pub use error::{QueueError, QueueResult};
pub use manager::{
    EnqueueReceipt, JobStatusView, PipelineStats, QueueHealth, QueueManager, SystemHealth,
};
pub use queue::JobQueue;
