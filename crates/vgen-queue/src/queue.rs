//! Backend-agnostic job queue.

use std::time::Duration;

use vgen_models::{Job, JobId, JobOutput, JobPayload};

use crate::backend::{DisabledQueue, MemoryQueue, RedisQueue};
use crate::config::{EnqueueOptions, QueueStats, RetentionPolicy, StalledReport};
use crate::error::QueueResult;

/// A named job queue over one of the supported backends.
#[derive(Debug, Clone)]
pub enum JobQueue {
    Redis(RedisQueue),
    Memory(MemoryQueue),
    Disabled(DisabledQueue),
}

macro_rules! delegate {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            JobQueue::Redis(q) => q.$method($($arg),*).await,
            JobQueue::Memory(q) => q.$method($($arg),*).await,
            JobQueue::Disabled(q) => q.$method($($arg),*).await,
        }
    };
}

impl JobQueue {
    pub fn memory(name: impl Into<String>) -> Self {
        JobQueue::Memory(MemoryQueue::new(name))
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        JobQueue::Disabled(DisabledQueue::new(name))
    }

    pub fn name(&self) -> &str {
        match self {
            JobQueue::Redis(q) => q.name(),
            JobQueue::Memory(q) => q.name(),
            JobQueue::Disabled(q) => q.name(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            JobQueue::Redis(_) => "redis",
            JobQueue::Memory(_) => "memory",
            JobQueue::Disabled(_) => "disabled",
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, JobQueue::Disabled(_))
    }

    /// Add a job; returns its id.
    pub async fn enqueue(&self, payload: JobPayload, opts: EnqueueOptions) -> QueueResult<JobId> {
        delegate!(self.enqueue(payload, opts))
    }

    /// Claim the best ready job and mark it processing.
    ///
    /// Returns `None` when the queue is paused or has nothing ready.
    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        delegate!(self.dequeue())
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        delegate!(self.get(id))
    }

    /// Cancel a non-terminal job. Returns `false` for unknown or finished jobs.
    pub async fn cancel(&self, id: &JobId) -> QueueResult<bool> {
        delegate!(self.cancel(id))
    }

    /// Requeue a failed job with attempts remaining.
    pub async fn retry(&self, id: &JobId) -> QueueResult<bool> {
        delegate!(self.retry(id))
    }

    pub async fn update_progress(&self, id: &JobId, progress: u8) -> QueueResult<()> {
        delegate!(self.update_progress(id, progress))
    }

    pub async fn heartbeat(&self, id: &JobId) -> QueueResult<()> {
        delegate!(self.heartbeat(id))
    }

    pub async fn complete(
        &self,
        id: &JobId,
        output: JobOutput,
        warnings: Vec<String>,
    ) -> QueueResult<()> {
        delegate!(self.complete(id, output, warnings))
    }

    pub async fn fail(&self, id: &JobId, error: &str) -> QueueResult<()> {
        delegate!(self.fail(id, error))
    }

    pub async fn is_cancelled(&self, id: &JobId) -> QueueResult<bool> {
        delegate!(self.is_cancelled(id))
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        delegate!(self.stats())
    }

    pub async fn pause(&self) -> QueueResult<()> {
        delegate!(self.pause())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        delegate!(self.resume())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        delegate!(self.is_paused())
    }

    /// Remove terminal jobs older than `older_than`, then trim to the keep counts.
    pub async fn clean(&self, older_than: Duration, policy: RetentionPolicy) -> QueueResult<u64> {
        delegate!(self.clean(older_than, policy))
    }

    pub async fn recover_stalled(
        &self,
        window: Duration,
        max_stalled: u32,
    ) -> QueueResult<StalledReport> {
        delegate!(self.recover_stalled(window, max_stalled))
    }

    pub async fn ping(&self) -> QueueResult<()> {
        delegate!(self.ping())
    }
}
