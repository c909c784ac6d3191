//! Per-job context handed to handlers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::warn;
use vgen_models::{Job, JobId, JobKind, JobStatus};
use vgen_queue::JobQueue;
use vgen_storage::MediaStorage;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::records::{JobStatusUpdate, MediaRecords};

struct Inner {
    job_id: JobId,
    kind: JobKind,
    queue: JobQueue,
    records: Arc<dyn MediaRecords>,
    logger: JobLogger,
    work_dir: PathBuf,
    progress: AtomicU8,
}

/// Progress reporting, cancellation checks and scratch space for one job attempt.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<Inner>,
}

impl JobContext {
    pub fn new(
        job: &Job,
        queue: JobQueue,
        records: Arc<dyn MediaRecords>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                job_id: job.id.clone(),
                kind: job.kind,
                queue,
                records,
                logger: JobLogger::new(&job.id, job.kind, job.attempts),
                work_dir: work_dir.into(),
                progress: AtomicU8::new(job.progress),
            }),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    pub fn logger(&self) -> &JobLogger {
        &self.inner.logger
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn records(&self) -> &Arc<dyn MediaRecords> {
        &self.inner.records
    }

    /// Last progress value reported by this attempt.
    pub fn progress(&self) -> u8 {
        self.inner.progress.load(Ordering::SeqCst)
    }

    /// Report progress. Lower values than the last report are ignored.
    ///
    /// Store failures are logged, never raised: progress is advisory.
    pub async fn set_progress(&self, progress: u8, message: &str) {
        let progress = progress.min(99);
        let previous = self.inner.progress.fetch_max(progress, Ordering::SeqCst);
        if progress <= previous {
            return;
        }

        self.inner.logger.log_progress(progress, message);
        if let Err(e) = self.inner.queue.update_progress(&self.inner.job_id, progress).await {
            warn!(job_id = %self.inner.job_id, "Failed to store progress: {}", e);
        }
        let update = JobStatusUpdate::new(JobStatus::Processing, progress).with_message(message);
        if let Err(e) = self.inner.records.update_job_status(&self.inner.job_id, update).await {
            warn!(job_id = %self.inner.job_id, "Failed to mirror progress: {}", e);
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        match self.inner.queue.is_cancelled(&self.inner.job_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(job_id = %self.inner.job_id, "Failed to read cancel flag: {}", e);
                false
            }
        }
    }

    /// Phase boundary check; `Err(Cancelled)` once the job was cancelled.
    pub async fn check_cancelled(&self) -> WorkerResult<()> {
        if self.is_cancelled().await {
            self.inner.logger.log_warning("cancellation observed");
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }

    /// Cancellation check after uploads: a cancelled attempt deletes the
    /// objects under `keys` before returning `Err(Cancelled)`.
    pub async fn check_cancelled_after_upload(
        &self,
        storage: &dyn MediaStorage,
        keys: &[&str],
    ) -> WorkerResult<()> {
        if let Err(cancelled) = self.check_cancelled().await {
            for key in keys {
                if let Err(e) = storage.delete(key).await {
                    self.inner
                        .logger
                        .log_warning(&format!("failed to remove {} after cancel: {}", key, e));
                }
            }
            return Err(cancelled);
        }
        Ok(())
    }

    /// Private scratch directory, removed when dropped.
    pub fn temp_dir(&self) -> WorkerResult<TempDir> {
        std::fs::create_dir_all(&self.inner.work_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", self.inner.kind.as_str(), self.inner.job_id))
            .tempdir_in(&self.inner.work_dir)?;
        Ok(dir)
    }
}
