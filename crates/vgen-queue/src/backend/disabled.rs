//! No-op queue used when Redis is unreachable or queuing is turned off.

use std::time::Duration;

use tracing::{debug, warn};
use vgen_models::{Job, JobId, JobOutput, JobPayload};

use crate::config::{EnqueueOptions, QueueStats, RetentionPolicy, StalledReport};
use crate::error::QueueResult;

/// Every operation logs and returns an empty or successful default.
#[derive(Debug, Clone)]
pub struct DisabledQueue {
    name: String,
}

impl DisabledQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, payload: JobPayload, _opts: EnqueueOptions) -> QueueResult<JobId> {
        let id = JobId::new();
        warn!(
            queue = %self.name,
            job_id = %id,
            kind = payload.kind().as_str(),
            "Queue disabled, job will not be processed"
        );
        Ok(id)
    }

    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        Ok(None)
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        debug!(queue = %self.name, job_id = %id, "Queue disabled, no job status");
        Ok(None)
    }

    pub async fn cancel(&self, id: &JobId) -> QueueResult<bool> {
        debug!(queue = %self.name, job_id = %id, "Queue disabled, cancel ignored");
        Ok(false)
    }

    pub async fn retry(&self, id: &JobId) -> QueueResult<bool> {
        debug!(queue = %self.name, job_id = %id, "Queue disabled, retry ignored");
        Ok(false)
    }

    pub async fn update_progress(&self, _id: &JobId, _progress: u8) -> QueueResult<()> {
        Ok(())
    }

    pub async fn heartbeat(&self, _id: &JobId) -> QueueResult<()> {
        Ok(())
    }

    pub async fn complete(
        &self,
        _id: &JobId,
        _output: JobOutput,
        _warnings: Vec<String>,
    ) -> QueueResult<()> {
        Ok(())
    }

    pub async fn fail(&self, _id: &JobId, _error: &str) -> QueueResult<()> {
        Ok(())
    }

    pub async fn is_cancelled(&self, _id: &JobId) -> QueueResult<bool> {
        Ok(false)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats::default())
    }

    pub async fn pause(&self) -> QueueResult<()> {
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        Ok(false)
    }

    pub async fn clean(&self, _older_than: Duration, _policy: RetentionPolicy) -> QueueResult<u64> {
        Ok(0)
    }

    pub async fn recover_stalled(
        &self,
        _window: Duration,
        _max_stalled: u32,
    ) -> QueueResult<StalledReport> {
        Ok(StalledReport::default())
    }

    pub async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgen_models::GenerationPayload;

    #[tokio::test]
    async fn test_disabled_queue_returns_defaults() {
        let queue = DisabledQueue::new("generation");
        let id = queue
            .enqueue(GenerationPayload::new("a", 5).into(), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(!id.as_str().is_empty());
        assert!(queue.get(&id).await.unwrap().is_none());
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(!queue.cancel(&id).await.unwrap());
        assert!(!queue.retry(&id).await.unwrap());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }
}
