//! Export worker: re-encodes a stored video into a platform variant.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vgen_media::{ExportProfile, TranscodeRequest, Transcoder};
use vgen_models::encoding::DEFAULT_TRANSCODE_TIMEOUT_SECS;
use vgen_models::{
    ExportPayload, Job, JobOutput, MediaId, MediaKind, MediaRecord,
};
use vgen_storage::{MediaStorage, StorageError, StoredObject};

use crate::context::JobContext;
use crate::error::{WorkerError, WorkerResult};
use crate::executor::{JobHandler, JobOutcome};
use crate::records::MediaRecords;
use crate::retry::{retry_async, RetryConfig};

const PROGRESS_STARTED: u8 = 5;
const PROGRESS_SOURCE_FETCHED: u8 = 10;
const PROGRESS_PROFILE_RESOLVED: u8 = 20;
const PROGRESS_TRANSCODING: u8 = 30;
const PROGRESS_TRANSCODED: u8 = 80;
const PROGRESS_THUMBNAIL: u8 = 90;
const PROGRESS_UPLOADED: u8 = 95;

/// Handles `JobPayload::Export` jobs.
pub struct ExportWorker {
    storage: Arc<dyn MediaStorage>,
    transcoder: Arc<dyn Transcoder>,
    records: Arc<dyn MediaRecords>,
    key_prefix: String,
    transcode_timeout: Duration,
    transfer_retry: RetryConfig,
}

impl ExportWorker {
    pub fn new(
        storage: Arc<dyn MediaStorage>,
        transcoder: Arc<dyn Transcoder>,
        records: Arc<dyn MediaRecords>,
    ) -> Self {
        Self {
            storage,
            transcoder,
            records,
            key_prefix: "exports".to_string(),
            transcode_timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECS),
            transfer_retry: RetryConfig::new("storage transfer"),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_transcode_timeout(mut self, timeout: Duration) -> Self {
        self.transcode_timeout = timeout;
        self
    }

    pub fn with_transfer_retry(mut self, retry: RetryConfig) -> Self {
        self.transfer_retry = retry;
        self
    }

    async fn load_source(&self, source_id: &str) -> WorkerResult<MediaRecord> {
        let source = self
            .records
            .get_media(&MediaId::from(source_id))
            .await?
            .ok_or_else(|| WorkerError::SourceNotFound(source_id.to_string()))?;
        if !source.is_ready() {
            return Err(WorkerError::SourceNotReady(format!(
                "{} is {}",
                source_id,
                source.status.as_str()
            )));
        }
        if !self.storage.exists(&source.storage_path).await? {
            return Err(WorkerError::SourceNotFound(format!(
                "{} has no object at {}",
                source_id, source.storage_path
            )));
        }
        Ok(source)
    }

    async fn upload(&self, local: &Path, key: &str) -> WorkerResult<StoredObject> {
        let stored = retry_async(
            &self.transfer_retry,
            || self.storage.upload(local, key),
            StorageError::is_retryable,
        )
        .await?;
        Ok(stored)
    }

    async fn export(
        &self,
        ctx: &JobContext,
        job: &Job,
        payload: &ExportPayload,
    ) -> WorkerResult<JobOutcome> {
        ctx.set_progress(PROGRESS_STARTED, "export started").await;
        let source = self.load_source(&payload.source_media_id).await?;
        let workdir = ctx.temp_dir()?;

        let extension = source
            .storage_path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.contains('/'))
            .unwrap_or("mp4");
        let input = workdir.path().join(format!("source.{}", extension));
        retry_async(
            &self.transfer_retry,
            || self.storage.download(&source.storage_path, &input),
            StorageError::is_retryable,
        )
        .await?;
        ctx.set_progress(PROGRESS_SOURCE_FETCHED, "source downloaded").await;
        ctx.check_cancelled().await?;

        let profile = ExportProfile::resolve(payload)
            .map_err(|e| WorkerError::invalid_payload(e.to_string()))?;
        ctx.set_progress(
            PROGRESS_PROFILE_RESOLVED,
            &format!("variant {}", profile.variant),
        )
        .await;

        let media_id = MediaId::new();
        let output = workdir.path().join(format!("{}.mp4", media_id));
        let request = TranscodeRequest::from_profile(&input, &output, &profile)
            .with_timeout(self.transcode_timeout);
        ctx.set_progress(PROGRESS_TRANSCODING, "transcoding").await;
        ctx.check_cancelled().await?;

        let result = self.transcoder.process(&request).await;
        if !result.success {
            return Err(WorkerError::TranscodeFailed {
                message: result
                    .error
                    .unwrap_or_else(|| "transcode failed".to_string()),
                timed_out: result.timed_out,
            });
        }
        let mut warnings = result.warnings.clone();
        for warning in &warnings {
            ctx.logger().log_warning(warning);
        }
        ctx.set_progress(PROGRESS_TRANSCODED, "transcoded").await;
        ctx.check_cancelled().await?;

        let thumbnail = workdir.path().join(format!("{}.jpg", media_id));
        let thumbnail_ready = match self.transcoder.thumbnail(&output, &thumbnail).await {
            Ok(()) => true,
            Err(e) => {
                let warning = format!("thumbnail generation failed: {}", e);
                ctx.logger().log_warning(&warning);
                warnings.push(warning);
                false
            }
        };
        ctx.set_progress(PROGRESS_THUMBNAIL, "thumbnail step finished").await;

        let key = format!("{}/{}.mp4", self.key_prefix, media_id);
        let stored = self.upload(&output, &key).await?;
        let thumb_key = format!("{}/{}.jpg", self.key_prefix, media_id);
        let thumbnail_path = if thumbnail_ready {
            match self.upload(&thumbnail, &thumb_key).await {
                Ok(obj) => Some(obj.remote_path),
                Err(e) => {
                    let warning = format!("thumbnail upload failed: {}", e);
                    ctx.logger().log_warning(&warning);
                    warnings.push(warning);
                    None
                }
            }
        } else {
            None
        };
        ctx.set_progress(PROGRESS_UPLOADED, "uploaded").await;
        let mut uploaded = vec![key.as_str()];
        if thumbnail_path.is_some() {
            uploaded.push(thumb_key.as_str());
        }
        ctx.check_cancelled_after_upload(self.storage.as_ref(), &uploaded)
            .await?;

        let record = MediaRecord::new(MediaKind::Export, stored.remote_path.clone())
            .with_id(media_id.clone())
            .with_public_url(stored.public_url.clone())
            .with_thumbnail(thumbnail_path)
            .with_metadata(result.output_metadata.clone())
            .with_warnings(warnings.clone())
            .with_source(source.media_id.clone())
            .with_job(job.id.clone());
        self.records.create_media(record).await?;

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
impl JobHandler for ExportWorker {
    fn name(&self) -> &'static str {
        "export"
    }

    fn retries_transient_failures(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &JobContext, job: &Job) -> WorkerResult<JobOutcome> {
        let payload = job
            .payload
            .as_export()
            .ok_or_else(|| WorkerError::invalid_payload("expected an export payload"))?;
        job.payload
            .validate()
            .map_err(|e| WorkerError::invalid_payload(e.to_string()))?;
        self.export(ctx, job, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vgen_media::{MediaError, MediaResult, TranscodeResult, METADATA_ROTATE_WARNING};
    use vgen_models::{ExportVariant, JobPayload, MediaInfo, MediaStatus};
    use vgen_queue::{EnqueueOptions, JobQueue};
    use vgen_storage::LocalStorage;

    use crate::records::InMemoryRecords;

    /// Copies the input to the output and reports what the variant would.
    struct FakeTranscoder {
        fail_with: Option<(String, bool)>,
        thumbnails: bool,
        calls: AtomicUsize,
    }

    impl FakeTranscoder {
        fn ok() -> Self {
            Self {
                fail_with: None,
                thumbnails: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn process(&self, request: &TranscodeRequest) -> TranscodeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((message, timed_out)) = &self.fail_with {
                return TranscodeResult {
                    success: false,
                    error: Some(message.clone()),
                    timed_out: *timed_out,
                    ..Default::default()
                };
            }
            tokio::fs::copy(&request.input, &request.output).await.unwrap();
            let warnings = if request.variant == ExportVariant::MetadataRotate {
                vec![METADATA_ROTATE_WARNING.to_string()]
            } else {
                Vec::new()
            };
            TranscodeResult {
                success: true,
                output_metadata: Some(MediaInfo {
                    width: 1080,
                    height: 1920,
                    ..Default::default()
                }),
                warnings,
                ..Default::default()
            }
        }

        async fn probe(&self, _path: &Path) -> MediaResult<MediaInfo> {
            Ok(MediaInfo::default())
        }

        async fn thumbnail(&self, _video: &Path, output: &Path) -> MediaResult<()> {
            if !self.thumbnails {
                return Err(MediaError::internal("no frames"));
            }
            tokio::fs::write(output, b"jpeg").await?;
            Ok(())
        }
    }

    struct Fixture {
        queue: JobQueue,
        records: Arc<InMemoryRecords>,
        storage: Arc<LocalStorage>,
        _root: tempfile::TempDir,
        work: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::at(root.path()));
        let records = Arc::new(InMemoryRecords::new());

        let source = root.path().join("generated/src-1.mp4");
        tokio::fs::create_dir_all(source.parent().unwrap()).await.unwrap();
        tokio::fs::write(&source, b"landscape-video").await.unwrap();
        records.insert_media(
            MediaRecord::new(MediaKind::Generated, "generated/src-1.mp4")
                .with_id(MediaId::from("src-1")),
        );

        Fixture {
            queue: JobQueue::memory("export"),
            records,
            storage,
            _root: root,
            work: tempfile::tempdir().unwrap(),
        }
    }

    async fn run(fx: &Fixture, worker: &ExportWorker, payload: ExportPayload) -> (Job, WorkerResult<JobOutcome>) {
        fx.queue
            .enqueue(JobPayload::Export(payload), EnqueueOptions::default())
            .await
            .unwrap();
        let job = fx.queue.dequeue().await.unwrap().unwrap();
        let ctx = JobContext::new(&job, fx.queue.clone(), fx.records.clone(), fx.work.path());
        let result = worker.handle(&ctx, &job).await;
        (job, result)
    }

    fn worker(fx: &Fixture, transcoder: Arc<FakeTranscoder>) -> ExportWorker {
        ExportWorker::new(fx.storage.clone(), transcoder, fx.records.clone())
            .with_transfer_retry(RetryConfig::new("test transfer").with_base_delay(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_metadata_rotate_warning_is_stored() {
        let fx = fixture().await;
        let worker = worker(&fx, Arc::new(FakeTranscoder::ok()));

        let (job, result) = run(
            &fx,
            &worker,
            ExportPayload::new("src-1", ExportVariant::MetadataRotate),
        )
        .await;
        let outcome = result.unwrap();

        assert_eq!(outcome.warnings, vec![METADATA_ROTATE_WARNING.to_string()]);
        assert!(outcome.output.storage_path.starts_with("exports/"));
        assert!(fx.storage.root().join(&outcome.output.storage_path).exists());

        let stored = fx.records.media_for_job(&job.id);
        assert_eq!(stored.len(), 1);
        let record = &stored[0];
        assert_eq!(record.kind, MediaKind::Export);
        assert_eq!(record.status, MediaStatus::Ready);
        assert_eq!(record.source_media_id, Some(MediaId::from("src-1")));
        assert_eq!(record.warnings, vec![METADATA_ROTATE_WARNING.to_string()]);
        assert!(record.thumbnail_path.is_some());
        assert_eq!(record.metadata.as_ref().map(|m| m.height), Some(1920));
    }

    #[tokio::test]
    async fn test_thumbnail_failure_is_a_warning() {
        let fx = fixture().await;
        let transcoder = Arc::new(FakeTranscoder {
            thumbnails: false,
            ..FakeTranscoder::ok()
        });
        let worker = worker(&fx, transcoder);

        let (_, result) = run(
            &fx,
            &worker,
            ExportPayload::new("src-1", ExportVariant::GuaranteedUpright),
        )
        .await;
        let outcome = result.unwrap();

        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("thumbnail generation failed"));
        assert_eq!(fx.records.media_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let fx = fixture().await;
        let transcoder = Arc::new(FakeTranscoder::ok());
        let worker = worker(&fx, transcoder.clone());

        let (_, result) = run(
            &fx,
            &worker,
            ExportPayload::new("nope", ExportVariant::ScalePad),
        )
        .await;
        let err = result.unwrap_err();

        assert!(matches!(err, WorkerError::SourceNotFound(_)));
        assert!(err.is_permanent());
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_record_without_object_is_not_found() {
        let fx = fixture().await;
        fx.records.insert_media(
            MediaRecord::new(MediaKind::Generated, "generated/lost.mp4")
                .with_id(MediaId::from("lost")),
        );
        let transcoder = Arc::new(FakeTranscoder::ok());
        let worker = worker(&fx, transcoder.clone());

        let (_, result) = run(
            &fx,
            &worker,
            ExportPayload::new("lost", ExportVariant::ScalePad),
        )
        .await;
        let err = result.unwrap_err();

        assert!(matches!(err, WorkerError::SourceNotFound(ref m) if m.contains("generated/lost.mp4")));
        assert!(err.is_permanent());
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_not_ready_is_permanent() {
        let fx = fixture().await;
        fx.records.insert_media(
            MediaRecord::new(MediaKind::Generated, "generated/pending.mp4")
                .with_id(MediaId::from("pending"))
                .with_status(MediaStatus::Processing),
        );
        let worker = worker(&fx, Arc::new(FakeTranscoder::ok()));

        let (_, result) = run(
            &fx,
            &worker,
            ExportPayload::new("pending", ExportVariant::ScalePad),
        )
        .await;

        assert!(matches!(result, Err(WorkerError::SourceNotReady(_))));
    }

    #[tokio::test]
    async fn test_transcode_timeout_is_retryable() {
        let fx = fixture().await;
        let transcoder = Arc::new(FakeTranscoder {
            fail_with: Some(("timed out after 600s".to_string(), true)),
            ..FakeTranscoder::ok()
        });
        let worker = worker(&fx, transcoder);

        let (job, result) = run(
            &fx,
            &worker,
            ExportPayload::new("src-1", ExportVariant::HorizontalPassthrough),
        )
        .await;
        let err = result.unwrap_err();

        assert!(matches!(err, WorkerError::TranscodeFailed { timed_out: true, .. }));
        assert!(err.is_retryable());
        assert!(fx.records.media_for_job(&job.id).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_transcode() {
        let fx = fixture().await;
        let transcoder = Arc::new(FakeTranscoder::ok());
        let worker = worker(&fx, transcoder.clone());

        fx.queue
            .enqueue(
                JobPayload::Export(ExportPayload::new("src-1", ExportVariant::ScalePad)),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let job = fx.queue.dequeue().await.unwrap().unwrap();
        fx.queue.cancel(&job.id).await.unwrap();
        let ctx = JobContext::new(&job, fx.queue.clone(), fx.records.clone(), fx.work.path());

        let result = worker.handle(&ctx, &job).await;
        assert!(matches!(result, Err(WorkerError::Cancelled)));
        assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    }
}
