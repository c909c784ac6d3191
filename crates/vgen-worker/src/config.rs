//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vgen_models::encoding::DEFAULT_TRANSCODE_TIMEOUT_SECS;
use vgen_render::PollOptions;

use crate::executor::PoolConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent generation jobs
    pub generation_concurrency: usize,
    /// Concurrent export jobs
    pub export_concurrency: usize,
    /// Sleep between dequeue attempts when the queue is empty
    pub idle_poll_interval: Duration,
    /// Interval for refreshing job ownership while processing
    pub heartbeat_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for per-job temporary files
    pub work_dir: PathBuf,
    /// Hard limit for one FFmpeg invocation
    pub transcode_timeout: Duration,
    /// Storage key prefix for generated videos
    pub generated_prefix: String,
    /// Storage key prefix for exports and thumbnails
    pub export_prefix: String,
    /// Render operation polling
    pub poll: PollOptions,
    /// How often stale polling sessions are swept
    pub stale_sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            generation_concurrency: 3,
            export_concurrency: 2,
            idle_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("vgen"),
            transcode_timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECS),
            generated_prefix: "generated".to_string(),
            export_prefix: "exports".to_string(),
            poll: PollOptions::default(),
            stale_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        Self {
            generation_concurrency: count("GENERATION_CONCURRENCY", defaults.generation_concurrency),
            export_concurrency: count("EXPORT_CONCURRENCY", defaults.export_concurrency),
            idle_poll_interval: Duration::from_millis(
                std::env::var("WORKER_IDLE_POLL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            heartbeat_interval: secs("WORKER_HEARTBEAT_SECS", defaults.heartbeat_interval),
            shutdown_timeout: secs("WORKER_SHUTDOWN_TIMEOUT", defaults.shutdown_timeout),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            transcode_timeout: secs("TRANSCODE_TIMEOUT_SECS", defaults.transcode_timeout),
            generated_prefix: std::env::var("GENERATED_PREFIX")
                .unwrap_or(defaults.generated_prefix),
            export_prefix: std::env::var("EXPORT_PREFIX").unwrap_or(defaults.export_prefix),
            poll: PollOptions::from_env(),
            stale_sweep_interval: secs("POLL_SWEEP_INTERVAL_SECS", defaults.stale_sweep_interval),
        }
    }

    /// Pool settings for a pool of `concurrency` job slots.
    pub fn pool_config(&self, concurrency: usize) -> PoolConfig {
        PoolConfig {
            concurrency,
            idle_poll_interval: self.idle_poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            shutdown_timeout: self.shutdown_timeout,
            work_dir: self.work_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.generation_concurrency, 3);
        assert_eq!(config.export_concurrency, 2);
        assert_eq!(config.transcode_timeout, Duration::from_secs(600));
        assert_eq!(config.poll.max_polls, 360);
    }

    #[test]
    fn test_pool_config_shares_timing() {
        let config = WorkerConfig::default();
        let pool = config.pool_config(config.export_concurrency);
        assert_eq!(pool.concurrency, 2);
        assert_eq!(pool.heartbeat_interval, config.heartbeat_interval);
        assert_eq!(pool.work_dir, config.work_dir);
    }
}
