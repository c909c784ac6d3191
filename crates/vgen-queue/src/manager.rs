//! Queue manager: owns the generation and export queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vgen_models::{
    ExportPayload, GenerationPayload, JobId, JobKind, JobOutput, JobPayload, JobStatus,
};

use crate::backend::RedisQueue;
use crate::config::{EnqueueOptions, QueueBackend, QueueConfig, QueueStats};
use crate::error::QueueResult;
use crate::metrics::{record_queue_health, record_queue_stats};
use crate::queue::JobQueue;

/// Returned by [`QueueManager::add_generation_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    /// Jobs waiting or running ahead of this one
    pub queue_position: u64,
    pub estimated_wait: Duration,
}

/// Caller-facing job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobStatus,
    pub progress: u8,
    pub result: Option<JobOutput>,
    pub error: Option<String>,
    pub attempts_made: u32,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub generation: QueueStats,
    pub export: QueueStats,
    pub total: QueueStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueHealth {
    pub name: String,
    pub backend: &'static str,
    pub healthy: bool,
    pub stats: QueueStats,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub is_healthy: bool,
    pub queues: Vec<QueueHealth>,
}

/// Entry point for enqueueing and inspecting pipeline jobs.
///
/// Built once at startup and shared as `Arc<QueueManager>`.
pub struct QueueManager {
    generation: JobQueue,
    export: JobQueue,
    config: QueueConfig,
    /// Set while queues are paused on purpose
    paused_on_purpose: AtomicBool,
    maintenance_stop: watch::Sender<bool>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    /// Build queues for the configured backend.
    ///
    /// An unreachable Redis degrades both queues to disabled no-ops.
    pub async fn connect(config: QueueConfig) -> Self {
        let (generation, export) = match config.backend {
            QueueBackend::Memory => (
                JobQueue::memory(&config.generation_queue),
                JobQueue::memory(&config.export_queue),
            ),
            QueueBackend::Disabled => {
                warn!("Queue backend disabled, jobs will not be processed");
                Self::disabled_pair(&config)
            }
            QueueBackend::Redis => match Self::connect_redis(&config).await {
                Ok(pair) => {
                    info!(redis_url = %config.redis_url, "Connected to Redis job queues");
                    pair
                }
                Err(e) => {
                    warn!("Redis unavailable, job queues disabled: {}", e);
                    Self::disabled_pair(&config)
                }
            },
        };
        Self::from_queues(generation, export, config)
    }

    async fn connect_redis(config: &QueueConfig) -> QueueResult<(JobQueue, JobQueue)> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| crate::error::QueueError::connection_failed(e.to_string()))?;
        let generation = RedisQueue::new(conn.clone(), &config.key_prefix, &config.generation_queue);
        let export = RedisQueue::new(conn, &config.key_prefix, &config.export_queue);
        generation.ping().await?;
        Ok((JobQueue::Redis(generation), JobQueue::Redis(export)))
    }

    fn disabled_pair(config: &QueueConfig) -> (JobQueue, JobQueue) {
        (
            JobQueue::disabled(&config.generation_queue),
            JobQueue::disabled(&config.export_queue),
        )
    }

    pub fn from_queues(generation: JobQueue, export: JobQueue, config: QueueConfig) -> Self {
        let (maintenance_stop, _) = watch::channel(false);
        Self {
            generation,
            export,
            config,
            paused_on_purpose: AtomicBool::new(false),
            maintenance_stop,
            maintenance: Mutex::new(Vec::new()),
        }
    }

    pub fn generation_queue(&self) -> &JobQueue {
        &self.generation
    }

    pub fn export_queue(&self) -> &JobQueue {
        &self.export
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn queues(&self) -> [&JobQueue; 2] {
        [&self.generation, &self.export]
    }

    pub async fn add_generation_job(
        &self,
        payload: GenerationPayload,
        opts: EnqueueOptions,
    ) -> QueueResult<EnqueueReceipt> {
        let payload = JobPayload::Generate(payload);
        payload.validate()?;

        let ahead = self.generation.stats().await?;
        let queue_position = ahead.waiting + ahead.active;
        let job_id = self.generation.enqueue(payload, opts).await?;
        let estimated_wait = self.estimate_wait(queue_position);

        info!(
            job_id = %job_id,
            queue_position,
            estimated_wait_secs = estimated_wait.as_secs(),
            "Added generation job"
        );
        Ok(EnqueueReceipt {
            job_id,
            queue_position,
            estimated_wait,
        })
    }

    fn estimate_wait(&self, position: u64) -> Duration {
        let concurrency = self.config.generation_concurrency.max(1) as u64;
        let avg = self.config.avg_generation_time.as_secs();
        Duration::from_secs(position.saturating_mul(avg) / concurrency)
    }

    pub async fn add_export_job(
        &self,
        payload: ExportPayload,
        opts: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let payload = JobPayload::Export(payload);
        payload.validate()?;
        let job_id = self.export.enqueue(payload, opts).await?;
        info!(job_id = %job_id, "Added export job");
        Ok(job_id)
    }

    async fn find(&self, id: &JobId) -> QueueResult<Option<(&JobQueue, vgen_models::Job)>> {
        for queue in self.queues() {
            if let Some(job) = queue.get(id).await? {
                return Ok(Some((queue, job)));
            }
        }
        Ok(None)
    }

    pub async fn get_job_status(&self, id: &JobId) -> QueueResult<Option<JobStatusView>> {
        Ok(self.find(id).await?.map(|(_, job)| JobStatusView {
            job_id: job.id,
            kind: job.kind,
            state: job.status,
            progress: job.progress,
            result: job.result,
            error: job.error,
            attempts_made: job.attempts,
            warnings: job.warnings,
        }))
    }

    pub async fn cancel_job(&self, id: &JobId) -> QueueResult<bool> {
        match self.find(id).await? {
            Some((queue, _)) => queue.cancel(id).await,
            None => Ok(false),
        }
    }

    pub async fn retry_job(&self, id: &JobId) -> QueueResult<bool> {
        match self.find(id).await? {
            Some((queue, _)) => queue.retry(id).await,
            None => Ok(false),
        }
    }

    pub async fn get_stats(&self) -> QueueResult<PipelineStats> {
        let generation = self.generation.stats().await?;
        let export = self.export.stats().await?;
        Ok(PipelineStats {
            generation,
            export,
            total: generation.merge(&export),
        })
    }

    async fn queue_health(&self, queue: &JobQueue) -> QueueHealth {
        let mut issues = Vec::new();
        let stats = if queue.is_disabled() {
            issues.push("queue disabled".to_string());
            QueueStats::default()
        } else {
            match queue.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    issues.push(format!("stats unavailable: {e}"));
                    QueueStats::default()
                }
            }
        };

        if stats.paused && !self.paused_on_purpose.load(Ordering::SeqCst) {
            issues.push("paused unexpectedly".to_string());
        }
        if stats.waiting > self.config.backlog_threshold {
            issues.push(format!(
                "backlog {} above threshold {}",
                stats.waiting, self.config.backlog_threshold
            ));
        }
        let ratio = stats.failure_ratio();
        if ratio > self.config.failure_ratio_threshold {
            issues.push(format!("failure ratio {:.2} above threshold", ratio));
        }

        QueueHealth {
            name: queue.name().to_string(),
            backend: queue.backend_name(),
            healthy: issues.is_empty(),
            stats,
            issues,
        }
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let mut queues = Vec::with_capacity(2);
        for queue in self.queues() {
            queues.push(self.queue_health(queue).await);
        }
        SystemHealth {
            is_healthy: queues.iter().all(|q| q.healthy),
            queues,
        }
    }

    pub async fn pause_all(&self) -> QueueResult<()> {
        self.paused_on_purpose.store(true, Ordering::SeqCst);
        for queue in self.queues() {
            queue.pause().await?;
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> QueueResult<()> {
        for queue in self.queues() {
            queue.resume().await?;
        }
        self.paused_on_purpose.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// One cleanup pass over both queues.
    pub async fn run_cleanup(&self) -> u64 {
        let mut removed = 0;
        for queue in self.queues() {
            match queue.clean(self.config.retention_age, self.config.retention).await {
                Ok(n) => removed += n,
                Err(e) => warn!(queue = queue.name(), "Cleanup failed: {}", e),
            }
        }
        removed
    }

    /// One health pass: log, record gauges and recover stalled jobs.
    pub async fn run_health_check(&self) -> SystemHealth {
        for queue in self.queues() {
            match queue
                .recover_stalled(self.config.stall_window, self.config.max_stalled)
                .await
            {
                Ok(report) if !report.is_empty() => info!(
                    queue = queue.name(),
                    requeued = report.requeued.len(),
                    failed = report.failed.len(),
                    "Recovered stalled jobs"
                ),
                Ok(_) => {}
                Err(e) => warn!(queue = queue.name(), "Stalled job recovery failed: {}", e),
            }
        }

        let health = self.get_system_health().await;
        for queue in &health.queues {
            record_queue_stats(&queue.name, &queue.stats);
            record_queue_health(&queue.name, queue.healthy);
            if queue.healthy {
                debug!(queue = %queue.name, waiting = queue.stats.waiting, active = queue.stats.active, "Queue healthy");
            } else {
                warn!(queue = %queue.name, issues = ?queue.issues, "Queue unhealthy");
            }
        }
        health
    }

    /// Start the cleanup and health loops. They stop on `shutdown` or [`Self::shutdown`].
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let cleanup = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            let mut stop = self.maintenance_stop.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let removed = manager.run_cleanup().await;
                            debug!(removed, "Queue cleanup pass finished");
                        }
                        _ = shutdown.changed() => break,
                        _ = stop.changed() => break,
                    }
                }
                debug!("Queue cleanup loop stopped");
            })
        };

        let health = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown;
            let mut stop = self.maintenance_stop.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.health_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            manager.run_health_check().await;
                        }
                        _ = shutdown.changed() => break,
                        _ = stop.changed() => break,
                    }
                }
                debug!("Queue health loop stopped");
            })
        };

        match self.maintenance.lock() {
            Ok(mut handles) => handles.extend([cleanup, health]),
            Err(_) => error!("Maintenance handle list poisoned"),
        }
    }

    /// Pause both queues, wait up to `grace` for active jobs, then stop maintenance.
    ///
    /// Returns `true` when every active job finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if let Err(e) = self.pause_all().await {
            warn!("Failed to pause queues during shutdown: {}", e);
        }

        let deadline = tokio::time::Instant::now() + grace;
        let drained = loop {
            match self.get_stats().await {
                Ok(stats) if stats.total.active == 0 => break true,
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read queue stats during shutdown: {}", e);
                    break false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };

        let _ = self.maintenance_stop.send(true);
        let handles = match self.maintenance.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }

        if drained {
            info!("Queues drained");
        } else {
            warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed with active jobs");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgen_models::ExportVariant;

    fn manager() -> QueueManager {
        let config = QueueConfig::memory();
        QueueManager::from_queues(
            JobQueue::memory(&config.generation_queue),
            JobQueue::memory(&config.export_queue),
            config,
        )
    }

    #[tokio::test]
    async fn test_generation_receipt_position_and_wait() {
        let manager = manager();
        let first = manager
            .add_generation_job(GenerationPayload::new("a", 5), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(first.queue_position, 0);
        assert_eq!(first.estimated_wait, Duration::ZERO);

        for prompt in ["b", "c"] {
            manager
                .add_generation_job(GenerationPayload::new(prompt, 5), EnqueueOptions::default())
                .await
                .unwrap();
        }
        let fourth = manager
            .add_generation_job(GenerationPayload::new("d", 5), EnqueueOptions::default())
            .await
            .unwrap();
        // 3 ahead x 120s / 3 workers
        assert_eq!(fourth.queue_position, 3);
        assert_eq!(fourth.estimated_wait, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let manager = manager();
        let err = manager
            .add_generation_job(GenerationPayload::new("   ", 5), EnqueueOptions::default())
            .await;
        tokio_test::assert_err!(err);
        assert_eq!(manager.get_stats().await.unwrap().total.waiting, 0);
    }

    #[tokio::test]
    async fn test_status_cancel_retry_across_queues() {
        let manager = manager();
        let export_id = manager
            .add_export_job(
                ExportPayload::new("media-1", ExportVariant::ScalePad),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let view = manager.get_job_status(&export_id).await.unwrap().unwrap();
        assert_eq!(view.kind, JobKind::Export);
        assert_eq!(view.state, JobStatus::Queued);
        assert_eq!(view.attempts_made, 1);

        assert!(manager.cancel_job(&export_id).await.unwrap());
        assert!(!manager.retry_job(&export_id).await.unwrap());
        assert!(manager.get_job_status(&JobId::from_string("nope")).await.unwrap().is_none());
        assert!(!manager.cancel_job(&JobId::from_string("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_flags_unexpected_pause_and_backlog() {
        let config = QueueConfig {
            backlog_threshold: 1,
            ..QueueConfig::memory()
        };
        let manager = QueueManager::from_queues(
            JobQueue::memory("generation"),
            JobQueue::memory("export"),
            config,
        );
        assert!(manager.get_system_health().await.is_healthy);

        manager.export_queue().pause().await.unwrap();
        for prompt in ["a", "b"] {
            manager
                .add_generation_job(GenerationPayload::new(prompt, 5), EnqueueOptions::default())
                .await
                .unwrap();
        }
        let health = manager.get_system_health().await;
        assert!(!health.is_healthy);
        assert!(health.queues[0].issues[0].contains("backlog"));
        assert_eq!(health.queues[1].issues, vec!["paused unexpectedly".to_string()]);

        // Pausing through the manager is expected.
        manager.pause_all().await.unwrap();
        let health = manager.get_system_health().await;
        assert!(health.queues[1].healthy);

        manager.resume_all().await.unwrap();
        assert!(!manager.export_queue().is_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_queues_are_unhealthy_but_safe() {
        let config = QueueConfig {
            backend: QueueBackend::Disabled,
            ..Default::default()
        };
        let manager = QueueManager::connect(config).await;
        assert!(manager.generation_queue().is_disabled());

        let receipt = manager
            .add_generation_job(GenerationPayload::new("a", 5), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(manager.get_job_status(&receipt.job_id).await.unwrap().is_none());
        assert!(!manager.get_system_health().await.is_healthy);
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_disabled() {
        let config = QueueConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let manager = QueueManager::connect(config).await;
        assert!(manager.generation_queue().is_disabled());
        assert!(manager.export_queue().is_disabled());
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle_queues() {
        let manager = Arc::new(manager());
        let (_tx, rx) = watch::channel(false);
        manager.spawn_maintenance(rx);
        assert!(manager.shutdown(Duration::from_secs(1)).await);
        assert!(manager.generation_queue().is_paused().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_active_jobs() {
        let manager = manager();
        manager
            .add_generation_job(GenerationPayload::new("a", 5), EnqueueOptions::default())
            .await
            .unwrap();
        manager.generation_queue().dequeue().await.unwrap();
        assert!(!manager.shutdown(Duration::from_secs(2)).await);
    }
}
