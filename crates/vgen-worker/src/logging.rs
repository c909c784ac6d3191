//! Structured job logging.

use tracing::{error, info, warn, Span};
use vgen_models::{JobId, JobKind};

/// Emits lifecycle events carrying the job's id, kind and attempt.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    kind: JobKind,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, kind: JobKind, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            attempt,
        }
    }

    pub fn log_start(&self, handler: &str) {
        info!(job_id = %self.job_id, kind = self.kind.as_str(), attempt = self.attempt, handler, "Processing job");
    }

    pub fn log_progress(&self, progress: u8, step: &str) {
        info!(job_id = %self.job_id, kind = self.kind.as_str(), progress, step, "Job progress");
    }

    pub fn log_warning(&self, warning: &str) {
        warn!(job_id = %self.job_id, kind = self.kind.as_str(), warning, "Job warning");
    }

    pub fn log_error(&self, error: &str) {
        error!(job_id = %self.job_id, kind = self.kind.as_str(), attempt = self.attempt, error, "Job failed");
    }

    pub fn log_completion(&self, detail: &str) {
        info!(job_id = %self.job_id, kind = self.kind.as_str(), attempt = self.attempt, detail, "Job completed");
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Span covering one job attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            kind = self.kind.as_str(),
            attempt = self.attempt
        )
    }
}
