//! Worker pool: claims jobs from one queue and runs them with bounded concurrency.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn, Instrument};
use vgen_models::{Job, JobOutput, JobStatus};
use vgen_queue::JobQueue;

use crate::context::JobContext;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::{record_job_finished, record_job_retried, record_job_started, Outcome};
use crate::records::{JobStatusUpdate, MediaRecords};
use crate::retry::FailureTracker;

/// Successful result of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub output: JobOutput,
    pub warnings: Vec<String>,
}

/// Processes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Used in logs.
    fn name(&self) -> &'static str;

    /// Whether transient failures are requeued automatically while attempts remain.
    fn retries_transient_failures(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &JobContext, job: &Job) -> WorkerResult<JobOutcome>;
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub idle_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_timeout: Duration,
    pub work_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            idle_poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("vgen"),
        }
    }
}

/// Fixed-size pool of job tasks fed by [`JobQueue::dequeue`].
pub struct WorkerPool<H: JobHandler> {
    queue: JobQueue,
    handler: Arc<H>,
    records: Arc<dyn MediaRecords>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl<H: JobHandler> WorkerPool<H> {
    pub fn new(
        queue: JobQueue,
        handler: H,
        records: Arc<dyn MediaRecords>,
        config: PoolConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            handler: Arc::new(handler),
            records,
            config: PoolConfig {
                concurrency,
                ..config
            },
            semaphore: Arc::new(Semaphore::new(concurrency)),
            shutdown,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Signal shutdown; `run` stops claiming and drains in-flight jobs.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Claim and run jobs until shutdown.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            queue = self.queue.name(),
            handler = self.handler.name(),
            concurrency = self.config.concurrency,
            "Starting worker pool"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Reap finished tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                    .map_err(|_| WorkerError::job_failed("worker semaphore closed"))?,
                _ = shutdown.changed() => break,
            };

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let pool = self.executor();
                    tasks.spawn(async move {
                        let _permit = permit;
                        pool.execute(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = self.queue.name(), "Failed to dequeue job: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(
            queue = self.queue.name(),
            in_flight = tasks.len(),
            "Worker pool stopping, waiting for in-flight jobs"
        );
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                queue = self.queue.name(),
                remaining = tasks.len(),
                "Shutdown timeout elapsed, aborting remaining jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!(queue = self.queue.name(), "Worker pool stopped");
        Ok(())
    }

    /// Claim one job and run it to completion on the current task.
    ///
    /// Returns the final status, or `None` when nothing was ready.
    pub async fn process_next(&self) -> WorkerResult<Option<JobStatus>> {
        match self.queue.dequeue().await? {
            Some(job) => Ok(Some(self.executor().execute(job).await)),
            None => Ok(None),
        }
    }

    fn executor(&self) -> Executor<H> {
        Executor {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            records: Arc::clone(&self.records),
            heartbeat_interval: self.config.heartbeat_interval,
            work_dir: self.config.work_dir.clone(),
        }
    }
}

/// Everything a single job task needs, detached from the pool.
struct Executor<H: JobHandler> {
    queue: JobQueue,
    handler: Arc<H>,
    records: Arc<dyn MediaRecords>,
    heartbeat_interval: Duration,
    work_dir: PathBuf,
}

impl<H: JobHandler> Executor<H> {
    async fn execute(self, job: Job) -> JobStatus {
        let ctx = JobContext::new(&job, self.queue.clone(), Arc::clone(&self.records), &self.work_dir);
        let span = ctx.logger().create_span();
        self.execute_in(ctx, job).instrument(span).await
    }

    async fn execute_in(self, ctx: JobContext, job: Job) -> JobStatus {
        let started = Instant::now();
        ctx.logger().log_start(self.handler.name());
        record_job_started(job.kind);
        self.mirror(&job, JobStatusUpdate::new(JobStatus::Processing, job.progress)).await;

        let heartbeat = AbortOnDrop(self.spawn_heartbeat(&job));

        // The handler runs on its own task so a panic is contained to this job.
        let handler = Arc::clone(&self.handler);
        let handler_ctx = ctx.clone();
        let handler_job = job.clone();
        let mut running = AbortOnDrop(tokio::spawn(async move {
            handler.handle(&handler_ctx, &handler_job).await
        }));
        let joined = (&mut running.0).await;
        drop(heartbeat);

        let result = match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(WorkerError::job_failed(format!(
                "job panicked: {}",
                panic_message(join_err.into_panic())
            ))),
            Err(_) => Err(WorkerError::Cancelled),
        };

        let status = match result {
            Ok(outcome) => self.finish_success(&ctx, &job, outcome).await,
            Err(e) => self.finish_failure(&ctx, &job, e).await,
        };

        let outcome = match status {
            JobStatus::Completed => Outcome::Completed,
            JobStatus::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failed,
        };
        record_job_finished(job.kind, outcome, started.elapsed());
        status
    }

    fn spawn_heartbeat(&self, job: &Job) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let job_id = job.id.clone();
        let every = self.heartbeat_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut tracker = FailureTracker::new(3);
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.heartbeat(&job_id).await {
                    Ok(()) => tracker.record_success(),
                    Err(e) => {
                        if tracker.record_failure() {
                            warn!(job_id = %job_id, "Heartbeat failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn mirror(&self, job: &Job, update: JobStatusUpdate) {
        if let Err(e) = self.records.update_job_status(&job.id, update).await {
            warn!(job_id = %job.id, "Failed to mirror job status: {}", e);
        }
    }

    async fn finish_cancelled(&self, ctx: &JobContext, job: &Job) -> JobStatus {
        ctx.logger().log_warning("job cancelled, discarding work");
        self.mirror(job, JobStatusUpdate::new(JobStatus::Cancelled, ctx.progress()))
            .await;
        JobStatus::Cancelled
    }

    async fn finish_success(&self, ctx: &JobContext, job: &Job, outcome: JobOutcome) -> JobStatus {
        if ctx.is_cancelled().await {
            return self.finish_cancelled(ctx, job).await;
        }

        let JobOutcome { output, warnings } = outcome;
        for warning in &warnings {
            ctx.logger().log_warning(warning);
        }
        let media_id = output.media_id.clone();
        if let Err(e) = self.queue.complete(&job.id, output, warnings).await {
            error!(job_id = %job.id, "Failed to mark job completed: {}", e);
            return match self.queue.get(&job.id).await {
                Ok(Some(current)) => current.status,
                _ => JobStatus::Failed,
            };
        }

        self.mirror(
            job,
            JobStatusUpdate::new(JobStatus::Completed, 100).with_message(media_id.to_string()),
        )
        .await;
        ctx.logger().log_completion(&format!("media {}", media_id));
        JobStatus::Completed
    }

    async fn finish_failure(&self, ctx: &JobContext, job: &Job, err: WorkerError) -> JobStatus {
        if err.is_cancelled() || ctx.is_cancelled().await {
            return self.finish_cancelled(ctx, job).await;
        }

        let message = err.to_string();
        ctx.logger().log_error(&message);
        if let Err(e) = self.queue.fail(&job.id, &message).await {
            error!(job_id = %job.id, "Failed to mark job failed: {}", e);
        }
        self.mirror(
            job,
            JobStatusUpdate::new(JobStatus::Failed, ctx.progress()).with_message(&message),
        )
        .await;

        let retry_eligible = self.handler.retries_transient_failures()
            && err.is_retryable()
            && !err.is_permanent()
            && job.attempts < job.max_attempts;
        if !retry_eligible {
            return JobStatus::Failed;
        }

        match self.queue.retry(&job.id).await {
            Ok(true) => {
                info!(
                    job_id = %job.id,
                    attempt = job.attempts + 1,
                    max_attempts = job.max_attempts,
                    "Requeued after transient failure"
                );
                record_job_retried(job.kind);
                self.mirror(job, JobStatusUpdate::new(JobStatus::Queued, 0).with_message(&message))
                    .await;
                JobStatus::Queued
            }
            Ok(false) => JobStatus::Failed,
            Err(e) => {
                warn!(job_id = %job.id, "Automatic retry failed: {}", e);
                JobStatus::Failed
            }
        }
    }
}

/// Aborts the task when dropped, so aborting a job task also stops its
/// handler and heartbeat.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::InMemoryRecords;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use vgen_models::{GenerationPayload, MediaId};
    use vgen_queue::EnqueueOptions;

    enum Behavior {
        Succeed,
        FailTransient,
        FailPermanent,
        Panic,
        WaitForCancel,
        Slow(Duration),
    }

    struct TestHandler {
        behavior: Behavior,
        retries: bool,
        calls: Arc<AtomicU32>,
        finished: Arc<AtomicBool>,
    }

    impl TestHandler {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                retries: false,
                calls: Arc::new(AtomicU32::new(0)),
                finished: Arc::new(AtomicBool::new(false)),
            }
        }

        fn retrying(mut self) -> Self {
            self.retries = true;
            self
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        fn name(&self) -> &'static str {
            "test"
        }

        fn retries_transient_failures(&self) -> bool {
            self.retries
        }

        async fn handle(&self, ctx: &JobContext, _job: &Job) -> WorkerResult<JobOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_progress(50, "halfway").await;
            match self.behavior {
                Behavior::Succeed => Ok(JobOutcome {
                    output: JobOutput {
                        media_id: MediaId::from("m1"),
                        storage_path: "generated/m1.mp4".into(),
                        public_url: None,
                    },
                    warnings: vec!["minor".into()],
                }),
                Behavior::FailTransient => Err(WorkerError::Io(std::io::Error::other("disk busy"))),
                Behavior::FailPermanent => Err(WorkerError::SourceNotFound("m0".into())),
                Behavior::Panic => panic!("handler exploded"),
                Behavior::WaitForCancel => {
                    while !ctx.is_cancelled().await {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    ctx.check_cancelled().await?;
                    Err(WorkerError::job_failed("unreachable"))
                }
                Behavior::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    self.finished.store(true, Ordering::SeqCst);
                    Err(WorkerError::job_failed("slow job finished"))
                }
            }
        }
    }

    fn pool(handler: TestHandler, records: Arc<InMemoryRecords>) -> WorkerPool<TestHandler> {
        WorkerPool::new(
            JobQueue::memory("test"),
            handler,
            records,
            PoolConfig {
                idle_poll_interval: Duration::from_millis(5),
                work_dir: std::env::temp_dir().join("vgen-executor-tests"),
                ..Default::default()
            },
        )
    }

    async fn enqueue(pool: &WorkerPool<TestHandler>, max_attempts: u32) -> vgen_models::JobId {
        pool.queue()
            .enqueue(
                GenerationPayload::new("a", 5).into(),
                EnqueueOptions::default().with_max_attempts(max_attempts),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_with_warnings() {
        let records = Arc::new(InMemoryRecords::new());
        let pool = pool(TestHandler::new(Behavior::Succeed), records.clone());
        let id = enqueue(&pool, 3).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Completed));
        let job = pool.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.warnings, vec!["minor".to_string()]);
        assert_eq!(records.latest_job_status(&id).unwrap().status, JobStatus::Completed);
        assert_eq!(pool.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let records = Arc::new(InMemoryRecords::new());
        let pool = pool(TestHandler::new(Behavior::FailPermanent).retrying(), records.clone());
        let id = enqueue(&pool, 3).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Failed));
        let job = pool.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("m0"));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_attempts_exhausted() {
        let handler = TestHandler::new(Behavior::FailTransient).retrying();
        let calls = Arc::clone(&handler.calls);
        let pool = pool(handler, Arc::new(InMemoryRecords::new()));
        let id = enqueue(&pool, 2).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Queued));
        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Failed));
        assert_eq!(pool.process_next().await.unwrap(), None);

        let job = pool.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_without_auto_retry() {
        let pool = pool(TestHandler::new(Behavior::FailTransient), Arc::new(InMemoryRecords::new()));
        enqueue(&pool, 3).await;
        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let pool = pool(TestHandler::new(Behavior::Panic), Arc::new(InMemoryRecords::new()));
        let id = enqueue(&pool, 3).await;

        assert_eq!(pool.process_next().await.unwrap(), Some(JobStatus::Failed));
        let job = pool.queue().get(&id).await.unwrap().unwrap();
        assert!(job.error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_job() {
        let records = Arc::new(InMemoryRecords::new());
        let pool = Arc::new(pool(TestHandler::new(Behavior::WaitForCancel), records.clone()));
        let id = enqueue(&pool, 3).await;

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.process_next().await })
        };
        while pool.queue().get(&id).await.unwrap().unwrap().progress < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.queue().cancel(&id).await.unwrap());

        assert_eq!(runner.await.unwrap().unwrap(), Some(JobStatus::Cancelled));
        assert_eq!(records.latest_job_status(&id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(pool.queue().get(&id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_processes_in_priority_order_then_stops() {
        let handler = TestHandler::new(Behavior::Succeed);
        let pool = Arc::new(pool(handler, Arc::new(InMemoryRecords::new())));
        let mut ids = Vec::new();
        for priority in [30, 10, 20] {
            ids.push((
                priority,
                pool.queue()
                    .enqueue(
                        GenerationPayload::new("p", 5).into(),
                        EnqueueOptions::default().with_priority(priority),
                    )
                    .await
                    .unwrap(),
            ));
        }

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run().await })
        };
        loop {
            let stats = pool.queue().stats().await.unwrap();
            if stats.completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown();
        runner.await.unwrap().unwrap();

        let mut started = Vec::new();
        for (priority, id) in &ids {
            let job = pool.queue().get(id).await.unwrap().unwrap();
            started.push((job.started_at.unwrap(), *priority));
        }
        started.sort();
        let order: Vec<u32> = started.into_iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_aborts_handler_and_heartbeat() {
        let handler = TestHandler::new(Behavior::Slow(Duration::from_millis(300)));
        let calls = Arc::clone(&handler.calls);
        let finished = Arc::clone(&handler.finished);
        let pool = Arc::new(WorkerPool::new(
            JobQueue::memory("test"),
            handler,
            Arc::new(InMemoryRecords::new()),
            PoolConfig {
                idle_poll_interval: Duration::from_millis(5),
                heartbeat_interval: Duration::from_millis(100),
                shutdown_timeout: Duration::from_millis(20),
                work_dir: std::env::temp_dir().join("vgen-executor-tests"),
                ..Default::default()
            },
        ));
        let id = enqueue(&pool, 1).await;

        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run().await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown();
        runner.await.unwrap().unwrap();

        let heartbeat_at_stop = pool.queue().get(&id).await.unwrap().unwrap().last_heartbeat;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!finished.load(Ordering::SeqCst), "handler kept running after shutdown");
        let job = pool.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.last_heartbeat, heartbeat_at_stop);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
