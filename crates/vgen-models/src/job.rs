//! Job definitions and the job state machine.
//!
//! Every status change goes through a method on [`Job`] so that the
//! transition rules live in one place:
//!
//! ```text
//! Pending -> Queued -> Processing -> Completed
//!                               \-> Failed -> Pending (retry)
//! Pending | Queued | Processing -> Cancelled
//! Processing -> Queued (stall requeue)
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::media::MediaId;
use crate::payload::JobPayload;

/// Priority used when the caller does not pick one.
pub const DEFAULT_PRIORITY: u32 = 10;
/// Priority for operator-submitted jobs that should preempt normal traffic.
pub const HIGH_PRIORITY: u32 = 1;
/// Largest accepted priority value (keeps the Redis sort score exact).
pub const MAX_PRIORITY: u32 = 2_097_152;
/// Default number of processing attempts granted to a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Highest progress value a job may report before it is completed.
const MAX_IN_FLIGHT_PROGRESS: u8 = 99;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Type of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Render a new video through the external generation service
    Generate,
    /// Re-encode an existing video into an export variant
    Export,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Generate => "generate",
            JobKind::Export => "export",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted but not yet dequeueable (delayed or awaiting re-enqueue)
    #[default]
    Pending,
    /// Waiting in the queue for a worker
    Queued,
    /// Claimed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output reference recorded on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobOutput {
    /// Media record created for the output
    pub media_id: MediaId,
    /// Storage path of the uploaded file
    pub storage_path: String,
    /// Public URL, when the storage backend exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

/// Rejected job state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {job_id}: cannot move from {from} to {to}")]
    Invalid {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id}: all {max_attempts} attempts used")]
    AttemptsExhausted { job_id: JobId, max_attempts: u32 },
}

/// A unit of work tracked by a queue.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job type (derived from the payload)
    pub kind: JobKind,

    /// Current status
    #[serde(default)]
    pub status: JobStatus,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Kind-specific parameters
    pub payload: JobPayload,

    /// Lower values are dequeued first
    pub priority: u32,

    /// Processing attempts granted so far, including the initial one
    pub attempts: u32,

    /// Upper bound for `attempts`
    pub max_attempts: u32,

    /// Output reference (when completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,

    /// Error message (when failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Non-fatal warnings collected while processing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Set when a caller cancelled the job; workers check it between phases
    #[serde(default)]
    pub cancel_requested: bool,

    /// How many times the job was requeued after stalling
    #[serde(default)]
    pub stalled_count: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the job became dequeueable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,

    /// Earliest time the job may be dequeued (delayed jobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,

    /// Started at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completed/failed/cancelled at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last heartbeat from the owning worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job for a payload.
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: payload.kind(),
            status: JobStatus::Pending,
            progress: 0,
            payload,
            priority: DEFAULT_PRIORITY,
            attempts: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            result: None,
            error: None,
            warnings: Vec::new(),
            cancel_requested: false,
            stalled_count: 0,
            created_at: now,
            queued_at: None,
            ready_at: None,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            updated_at: now,
        }
    }

    /// Set priority (clamped to `1..=MAX_PRIORITY`).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority.clamp(1, MAX_PRIORITY);
        self
    }

    /// Set the attempt budget (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay the job; it stays pending until the delay has elapsed.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.ready_at = Some(self.created_at + to_chrono(delay));
        }
        self
    }

    /// Check if the job is still waiting for its delay to elapse.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.ready_at.is_some_and(|at| at > now)
    }

    /// Pending -> Queued.
    pub fn mark_queued(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Pending], JobStatus::Queued)?;
        let now = Utc::now();
        self.status = JobStatus::Queued;
        self.queued_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Queued -> Processing.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Queued], JobStatus::Processing)?;
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Update progress while processing.
    ///
    /// Values never decrease and stay below 100 until [`Job::complete`].
    /// Returns `true` when the stored value changed.
    pub fn set_progress(&mut self, progress: u8) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let progress = progress.min(MAX_IN_FLIGHT_PROGRESS);
        if progress <= self.progress {
            return false;
        }
        let now = Utc::now();
        self.progress = progress;
        self.last_heartbeat = Some(now);
        self.updated_at = now;
        true
    }

    /// Record a heartbeat from the owning worker.
    pub fn heartbeat(&mut self) {
        if self.status == JobStatus::Processing {
            let now = Utc::now();
            self.last_heartbeat = Some(now);
            self.updated_at = now;
        }
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, output: JobOutput) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Processing], JobStatus::Completed)?;
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(output);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Pending | Queued | Processing -> Failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_status(
            &[JobStatus::Pending, JobStatus::Queued, JobStatus::Processing],
            JobStatus::Failed,
        )?;
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Pending | Queued | Processing -> Cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.expect_status(
            &[JobStatus::Pending, JobStatus::Queued, JobStatus::Processing],
            JobStatus::Cancelled,
        )?;
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.cancel_requested = true;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Failed -> Pending, granting one more attempt.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Failed], JobStatus::Pending)?;
        if self.attempts >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                job_id: self.id.clone(),
                max_attempts: self.max_attempts,
            });
        }
        self.reset_attempt();
        self.status = JobStatus::Pending;
        self.ready_at = None;
        Ok(())
    }

    /// Processing -> Queued, used when the owning worker stopped heartbeating.
    pub fn requeue_stalled(&mut self) -> Result<(), TransitionError> {
        self.expect_status(&[JobStatus::Processing], JobStatus::Queued)?;
        self.reset_attempt();
        self.stalled_count += 1;
        self.status = JobStatus::Queued;
        self.queued_at = Some(self.updated_at);
        Ok(())
    }

    /// Check if an explicit retry would be accepted.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }

    /// Check if a processing job missed its heartbeat window.
    pub fn is_stalled(&self, window: Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        match self.last_heartbeat.or(self.started_at) {
            Some(beat) => now - beat > to_chrono(window),
            None => true,
        }
    }

    /// Add a non-fatal warning.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
        self.updated_at = Utc::now();
    }

    fn reset_attempt(&mut self) {
        let now = Utc::now();
        self.attempts += 1;
        self.progress = 0;
        self.result = None;
        self.error = None;
        self.warnings.clear();
        self.started_at = None;
        self.completed_at = None;
        self.queued_at = None;
        self.last_heartbeat = None;
        self.updated_at = now;
    }

    fn expect_status(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                job_id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ExportPayload, ExportVariant, GenerationPayload};

    fn generation_job() -> Job {
        Job::new(JobPayload::Generate(GenerationPayload::new("a fox in the snow", 5)))
    }

    fn output() -> JobOutput {
        JobOutput {
            media_id: MediaId::from("media-1"),
            storage_path: "generated/media-1.mp4".to_string(),
            public_url: None,
        }
    }

    fn processing_job() -> Job {
        let mut job = generation_job();
        job.mark_queued().unwrap();
        job.start().unwrap();
        job
    }

    #[test]
    fn test_job_creation() {
        let job = generation_job();
        assert_eq!(job.kind, JobKind::Generate);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress, 0);

        let export = Job::new(JobPayload::Export(ExportPayload::new(
            "media-1",
            ExportVariant::ScalePad,
        )));
        assert_eq!(export.kind, JobKind::Export);
    }

    #[test]
    fn test_job_state_transitions() {
        let mut job = processing_job();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        job.complete(output()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_below_100_while_processing() {
        let mut job = processing_job();
        assert!(job.set_progress(30));
        assert!(!job.set_progress(20));
        assert_eq!(job.progress, 30);

        assert!(job.set_progress(100));
        assert_eq!(job.progress, 99);
        assert_ne!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_progress_ignored_outside_processing() {
        let mut job = generation_job();
        assert!(!job.set_progress(50));
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut job = processing_job();
        assert!(matches!(job.retry(), Err(TransitionError::Invalid { .. })));

        job.set_progress(40);
        job.fail("render service unavailable").unwrap();
        assert!(job.can_retry());

        job.retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 2);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_retry_respects_attempt_budget() {
        let mut job = generation_job().with_max_attempts(1);
        job.mark_queued().unwrap();
        job.start().unwrap();
        job.fail("boom").unwrap();

        assert!(!job.can_retry());
        assert!(matches!(
            job.retry(),
            Err(TransitionError::AttemptsExhausted { max_attempts: 1, .. })
        ));
    }

    #[test]
    fn test_cancel_rules() {
        let mut pending = generation_job();
        pending.cancel().unwrap();
        assert_eq!(pending.status, JobStatus::Cancelled);
        assert!(pending.cancel_requested);

        let mut completed = processing_job();
        completed.complete(output()).unwrap();
        assert!(completed.cancel().is_err());
        assert_eq!(completed.status, JobStatus::Completed);
    }

    #[test]
    fn test_fail_never_stores_empty_error() {
        let mut job = processing_job();
        job.fail("   ").unwrap();
        assert_eq!(job.error.as_deref(), Some("unknown error"));
    }

    #[test]
    fn test_completed_job_cannot_fail() {
        let mut job = processing_job();
        job.complete(output()).unwrap();
        assert!(job.fail("late error").is_err());
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_stall_detection_and_requeue() {
        let mut job = processing_job();
        job.set_progress(60);
        let now = Utc::now();
        assert!(!job.is_stalled(Duration::from_secs(30), now));

        let later = now + chrono::Duration::seconds(120);
        assert!(job.is_stalled(Duration::from_secs(30), later));

        job.requeue_stalled().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.stalled_count, 1);
    }

    #[test]
    fn test_delay() {
        let job = generation_job().with_delay(Duration::from_secs(60));
        assert!(job.is_delayed(Utc::now()));
        assert!(!job.is_delayed(Utc::now() + chrono::Duration::seconds(61)));

        let immediate = generation_job().with_delay(Duration::ZERO);
        assert!(immediate.ready_at.is_none());
    }

    #[test]
    fn test_priority_clamped() {
        assert_eq!(generation_job().with_priority(0).priority, 1);
        assert_eq!(
            generation_job().with_priority(u32::MAX).priority,
            MAX_PRIORITY
        );
    }
}
