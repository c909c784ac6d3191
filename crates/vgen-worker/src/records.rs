//! Persistence port for media records and job status.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vgen_models::{JobId, JobStatus, MediaId, MediaRecord};

use crate::error::WorkerResult;

/// Job status snapshot mirrored into the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusUpdate {
    pub fn new(status: JobStatus, progress: u8) -> Self {
        Self {
            status,
            progress,
            message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Record store used by the workers.
#[async_trait]
pub trait MediaRecords: Send + Sync {
    async fn get_media(&self, media_id: &MediaId) -> WorkerResult<Option<MediaRecord>>;

    async fn create_media(&self, record: MediaRecord) -> WorkerResult<MediaRecord>;

    async fn update_job_status(&self, job_id: &JobId, update: JobStatusUpdate) -> WorkerResult<()>;
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecords {
    media: RwLock<HashMap<MediaId, MediaRecord>>,
    jobs: RwLock<HashMap<JobId, Vec<JobStatusUpdate>>>,
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert_media(&self, record: MediaRecord) {
        let mut media = self.media.write().unwrap_or_else(|e| e.into_inner());
        media.insert(record.media_id.clone(), record);
    }

    pub fn media_count(&self) -> usize {
        self.media.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Media records created by a job.
    pub fn media_for_job(&self, job_id: &JobId) -> Vec<MediaRecord> {
        let media = self.media.read().unwrap_or_else(|e| e.into_inner());
        media
            .values()
            .filter(|r| r.job_id.as_ref() == Some(job_id))
            .cloned()
            .collect()
    }

    /// Every status update recorded for a job, oldest first.
    pub fn job_history(&self, job_id: &JobId) -> Vec<JobStatusUpdate> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).cloned().unwrap_or_default()
    }

    pub fn latest_job_status(&self, job_id: &JobId) -> Option<JobStatusUpdate> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).and_then(|history| history.last().cloned())
    }
}

#[async_trait]
impl MediaRecords for InMemoryRecords {
    async fn get_media(&self, media_id: &MediaId) -> WorkerResult<Option<MediaRecord>> {
        let media = self.media.read().unwrap_or_else(|e| e.into_inner());
        Ok(media.get(media_id).cloned())
    }

    async fn create_media(&self, record: MediaRecord) -> WorkerResult<MediaRecord> {
        self.insert_media(record.clone());
        Ok(record)
    }

    async fn update_job_status(&self, job_id: &JobId, update: JobStatusUpdate) -> WorkerResult<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.entry(job_id.clone()).or_default().push(update);
        Ok(())
    }
}
