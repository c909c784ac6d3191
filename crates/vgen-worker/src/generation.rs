//! Generation worker: submits a render operation, polls it, stores the result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use vgen_media::Transcoder;
use vgen_models::{
    GenerationMode, GenerationPayload, Job, JobOutput, MediaId, MediaKind, MediaRecord,
};
use vgen_render::{
    ContextImage, OperationPoller, OperationResult, PollError, PollEvent, PollOptions,
    RenderRequest, RenderService,
};
use vgen_storage::{content_type_for, MediaStorage, StorageError};

use crate::context::JobContext;
use crate::error::{WorkerError, WorkerResult};
use crate::executor::{JobHandler, JobOutcome};
use crate::records::MediaRecords;
use crate::retry::{retry_async, RetryConfig};

/// Progress after the job starts.
const PROGRESS_STARTED: u8 = 5;
/// Progress once context media is ready.
const PROGRESS_CONTEXT_READY: u8 = 10;
/// Progress once the operation is submitted.
const PROGRESS_SUBMITTED: u8 = 20;
/// Width of the band the render progress is mapped into (20..=85).
const RENDER_BAND: u32 = 65;
const PROGRESS_RENDERED: u8 = 85;
const PROGRESS_DOWNLOADED: u8 = 92;
const PROGRESS_UPLOADED: u8 = 96;
const PROGRESS_PERSISTED: u8 = 99;

/// Map render-service progress (0-100) into the job's polling band.
pub fn scale_render_progress(progress: u8) -> u8 {
    let p = progress.min(100) as u32;
    (PROGRESS_SUBMITTED as u32 + p * RENDER_BAND / 100) as u8
}

/// Handles `JobPayload::Generate` jobs.
pub struct GenerationWorker {
    render: Arc<dyn RenderService>,
    poller: OperationPoller,
    storage: Arc<dyn MediaStorage>,
    transcoder: Arc<dyn Transcoder>,
    records: Arc<dyn MediaRecords>,
    poll_options: PollOptions,
    key_prefix: String,
    transfer_retry: RetryConfig,
}

impl GenerationWorker {
    pub fn new(
        render: Arc<dyn RenderService>,
        poller: OperationPoller,
        storage: Arc<dyn MediaStorage>,
        transcoder: Arc<dyn Transcoder>,
        records: Arc<dyn MediaRecords>,
    ) -> Self {
        Self {
            render,
            poller,
            storage,
            transcoder,
            records,
            poll_options: PollOptions::default(),
            key_prefix: "generated".to_string(),
            transfer_retry: RetryConfig::new("storage transfer"),
        }
    }

    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_transfer_retry(mut self, retry: RetryConfig) -> Self {
        self.transfer_retry = retry;
        self
    }

    /// Context media may be a media id or a raw storage key.
    async fn context_image(&self, reference: &str, dir: &Path) -> WorkerResult<ContextImage> {
        let remote = match self.records.get_media(&MediaId::from(reference)).await? {
            Some(record) => record.storage_path,
            None => reference.to_string(),
        };
        let file_name = remote.rsplit('/').next().unwrap_or("context");
        let local = dir.join(format!("context-{}", file_name));

        retry_async(
            &self.transfer_retry,
            || self.storage.download(&remote, &local),
            StorageError::is_retryable,
        )
        .await?;

        let bytes = tokio::fs::read(&local).await?;
        Ok(ContextImage::from_bytes(&bytes, content_type_for(&remote)))
    }

    /// Relay poll events into the job until the operation finishes.
    async fn await_render(&self, ctx: &JobContext, operation_id: &str) -> WorkerResult<OperationResult> {
        let mut subscription = self
            .poller
            .start_polling(operation_id, self.poll_options.clone());

        while let Some(event) = subscription.recv().await {
            match event {
                PollEvent::Progress { progress, poll_count, .. } => {
                    if ctx.is_cancelled().await {
                        self.poller.stop_polling(operation_id);
                        return Err(WorkerError::Cancelled);
                    }
                    if let Some(p) = progress {
                        ctx.set_progress(
                            scale_render_progress(p),
                            &format!("rendering ({}%, poll {})", p, poll_count),
                        )
                        .await;
                    }
                }
                PollEvent::Complete { result, .. } => return Ok(result),
                PollEvent::Error { error, .. } => return Err(error.into()),
            }
        }
        Err(PollError::Stopped.into())
    }

    async fn generate(
        &self,
        ctx: &JobContext,
        job: &Job,
        payload: &GenerationPayload,
    ) -> WorkerResult<JobOutcome> {
        ctx.set_progress(PROGRESS_STARTED, "generation started").await;
        let workdir = ctx.temp_dir()?;

        let mut request = RenderRequest::from_payload(payload);
        if payload.mode == GenerationMode::ImageToVideo {
            let reference = payload
                .context_media
                .as_deref()
                .ok_or_else(|| WorkerError::invalid_payload("image-to-video requires context media"))?;
            let image = self.context_image(reference, workdir.path()).await?;
            request = request.with_image(image);
        }
        ctx.set_progress(PROGRESS_CONTEXT_READY, "context ready").await;
        ctx.check_cancelled().await?;

        let handle = self.render.submit(&request).await?;
        ctx.set_progress(
            PROGRESS_SUBMITTED,
            &format!("submitted operation {}", handle.operation_id),
        )
        .await;

        let result = self.await_render(ctx, &handle.operation_id).await?;
        ctx.set_progress(PROGRESS_RENDERED, "render finished").await;
        ctx.check_cancelled().await?;

        let local = workdir.path().join("generated.mp4");
        self.render.download_result(&result, &local).await?;
        ctx.set_progress(PROGRESS_DOWNLOADED, "result downloaded").await;
        ctx.check_cancelled().await?;

        let media_id = MediaId::new();
        let key = format!("{}/{}.mp4", self.key_prefix, media_id);
        let stored = retry_async(
            &self.transfer_retry,
            || self.storage.upload(&local, &key),
            StorageError::is_retryable,
        )
        .await?;
        ctx.set_progress(PROGRESS_UPLOADED, "uploaded").await;
        ctx.check_cancelled_after_upload(self.storage.as_ref(), &[&key])
            .await?;

        let mut warnings = Vec::new();
        let metadata = match self.transcoder.probe(&local).await {
            Ok(info) => Some(info),
            Err(e) => {
                warnings.push(format!("metadata unavailable: {}", e));
                None
            }
        };

        let record = MediaRecord::new(MediaKind::Generated, stored.remote_path.clone())
            .with_id(media_id.clone())
            .with_public_url(stored.public_url.clone())
            .with_metadata(metadata)
            .with_warnings(warnings.clone())
            .with_job(job.id.clone());
        self.records.create_media(record).await?;
        ctx.set_progress(PROGRESS_PERSISTED, "media record created").await;

        if let Err(e) = workdir.close() {
            ctx.logger().log_warning(&format!("failed to remove temp dir: {}", e));
        }

        Ok(JobOutcome {
            output: JobOutput {
                media_id,
                storage_path: stored.remote_path,
                public_url: stored.public_url,
            },
            warnings,
        })
    }
}

#[async_trait]
impl JobHandler for GenerationWorker {
    fn name(&self) -> &'static str {
        "generation"
    }

    async fn handle(&self, ctx: &JobContext, job: &Job) -> WorkerResult<JobOutcome> {
        let payload = job
            .payload
            .as_generation()
            .ok_or_else(|| WorkerError::invalid_payload("expected a generation payload"))?;
        job.payload
            .validate()
            .map_err(|e| WorkerError::invalid_payload(e.to_string()))?;
        self.generate(ctx, job, payload).await
    }
}
