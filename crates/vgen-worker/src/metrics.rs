//! Job metrics.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use vgen_models::JobKind;

pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "vgen_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vgen_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vgen_jobs_failed_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "vgen_jobs_cancelled_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vgen_jobs_retried_total";
    pub const JOBS_IN_FLIGHT: &str = "vgen_jobs_in_flight";
    pub const JOB_DURATION_SECONDS: &str = "vgen_job_duration_seconds";
}

pub fn record_job_started(kind: JobKind) {
    let labels = [("kind", kind.as_str().to_string())];
    counter!(names::JOBS_STARTED_TOTAL, &labels).increment(1);
    gauge!(names::JOBS_IN_FLIGHT, &labels).increment(1.0);
}

/// How a job attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

pub fn record_job_finished(kind: JobKind, outcome: Outcome, elapsed: Duration) {
    let labels = [("kind", kind.as_str().to_string())];
    gauge!(names::JOBS_IN_FLIGHT, &labels).decrement(1.0);

    let name = match outcome {
        Outcome::Completed => names::JOBS_COMPLETED_TOTAL,
        Outcome::Failed => names::JOBS_FAILED_TOTAL,
        Outcome::Cancelled => names::JOBS_CANCELLED_TOTAL,
    };
    counter!(name, &labels).increment(1);

    let labels = [
        ("kind", kind.as_str().to_string()),
        ("outcome", outcome.as_str().to_string()),
    ];
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
}

pub fn record_job_retried(kind: JobKind) {
    let labels = [("kind", kind.as_str().to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}
