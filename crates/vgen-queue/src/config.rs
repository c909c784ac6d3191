//! Queue configuration and shared value types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vgen_models::JobId;

/// Which queue implementation backs the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
    Disabled,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" | "in-memory" | "inmemory" => Ok(Self::Memory),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown queue backend: {other}")),
        }
    }
}

/// Terminal-job retention counts used by `clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    /// Also applies to cancelled jobs
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 300,
        }
    }
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Option<u32>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub cancelled: u64,
    pub paused: bool,
}

impl QueueStats {
    pub fn merge(&self, other: &QueueStats) -> QueueStats {
        QueueStats {
            waiting: self.waiting + other.waiting,
            active: self.active + other.active,
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
            delayed: self.delayed + other.delayed,
            cancelled: self.cancelled + other.cancelled,
            paused: self.paused || other.paused,
        }
    }

    /// Failed share of finished (completed + failed) jobs.
    pub fn failure_ratio(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

/// Outcome of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every Redis key
    pub key_prefix: String,
    pub generation_queue: String,
    pub export_queue: String,
    /// Processing jobs without a heartbeat for this long are stalled
    pub stall_window: Duration,
    /// Stall requeues allowed before a job is failed
    pub max_stalled: u32,
    pub retention: RetentionPolicy,
    /// Terminal jobs older than this are removed by cleanup
    pub retention_age: Duration,
    pub cleanup_interval: Duration,
    pub health_interval: Duration,
    /// Waiting jobs above this mark the queue unhealthy
    pub backlog_threshold: u64,
    /// Failure ratio above this marks the queue unhealthy
    pub failure_ratio_threshold: f64,
    /// Used for wait estimates
    pub avg_generation_time: Duration,
    pub generation_concurrency: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vgen".to_string(),
            generation_queue: "generation".to_string(),
            export_queue: "export".to_string(),
            stall_window: Duration::from_secs(120),
            max_stalled: 1,
            retention: RetentionPolicy::default(),
            retention_age: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(600),
            health_interval: Duration::from_secs(60),
            backlog_threshold: 100,
            failure_ratio_threshold: 0.5,
            avg_generation_time: Duration::from_secs(120),
            generation_concurrency: 3,
        }
    }
}

impl QueueConfig {
    /// Config for an in-process queue (single-node deployments and tests).
    pub fn memory() -> Self {
        Self {
            backend: QueueBackend::Memory,
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            backend: std::env::var("QUEUE_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backend),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            generation_queue: std::env::var("QUEUE_GENERATION_NAME")
                .unwrap_or(defaults.generation_queue),
            export_queue: std::env::var("QUEUE_EXPORT_NAME").unwrap_or(defaults.export_queue),
            stall_window: secs("QUEUE_STALL_WINDOW_SECS", defaults.stall_window),
            max_stalled: std::env::var("QUEUE_MAX_STALLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_stalled),
            retention: RetentionPolicy {
                keep_completed: std::env::var("QUEUE_KEEP_COMPLETED")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.retention.keep_completed),
                keep_failed: std::env::var("QUEUE_KEEP_FAILED")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.retention.keep_failed),
            },
            retention_age: secs("QUEUE_RETENTION_SECS", defaults.retention_age),
            cleanup_interval: secs("QUEUE_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            health_interval: secs("QUEUE_HEALTH_INTERVAL_SECS", defaults.health_interval),
            backlog_threshold: std::env::var("QUEUE_BACKLOG_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backlog_threshold),
            failure_ratio_threshold: std::env::var("QUEUE_FAILURE_RATIO_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.failure_ratio_threshold),
            avg_generation_time: secs("GENERATION_AVG_SECS", defaults.avg_generation_time),
            generation_concurrency: std::env::var("GENERATION_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.generation_concurrency),
        }
    }
}
