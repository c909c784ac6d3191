//! In-process queue for single-node deployments and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vgen_models::{Job, JobId, JobOutput, JobPayload, JobStatus};

use crate::config::{EnqueueOptions, QueueStats, RetentionPolicy, StalledReport};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// (priority, seq) -> job; first entry is the next job to claim
    waiting: BTreeMap<(u32, u64), JobId>,
    /// (ready_at, seq) -> job
    delayed: BTreeMap<(DateTime<Utc>, u64), JobId>,
    active: HashSet<JobId>,
    seq: u64,
    paused: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_waiting(&mut self, id: JobId, priority: u32) {
        let seq = self.next_seq();
        self.waiting.insert((priority, seq), id);
    }

    fn remove_waiting(&mut self, id: &JobId) -> bool {
        let before = self.waiting.len() + self.delayed.len();
        self.waiting.retain(|_, v| v != id);
        self.delayed.retain(|_, v| v != id);
        before != self.waiting.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<(DateTime<Utc>, u64)> =
            self.delayed.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();
        for key in due {
            let Some(id) = self.delayed.remove(&key) else {
                continue;
            };
            let priority = match self.jobs.get_mut(&id) {
                Some(job) => match job.mark_queued() {
                    Ok(_) => job.priority,
                    Err(_) => continue,
                },
                _ => continue,
            };
            self.push_waiting(id, priority);
        }
    }

    fn job_mut(&mut self, id: &JobId) -> QueueResult<&mut Job> {
        self.jobs.get_mut(id).ok_or_else(|| QueueError::not_found(id))
    }

    fn count(&self, status: JobStatus) -> u64 {
        self.jobs.values().filter(|j| j.status == status).count() as u64
    }
}

/// Priority queue held in process memory.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn enqueue(&self, payload: JobPayload, opts: EnqueueOptions) -> QueueResult<JobId> {
        let mut job = Job::new(payload);
        if let Some(priority) = opts.priority {
            job = job.with_priority(priority);
        }
        if let Some(max_attempts) = opts.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(delay) = opts.delay {
            job = job.with_delay(delay);
        }

        let id = job.id.clone();
        let mut state = self.lock();
        match job.ready_at {
            Some(ready_at) => {
                let seq = state.next_seq();
                state.delayed.insert((ready_at, seq), id.clone());
            }
            None => {
                job.mark_queued()?;
                state.push_waiting(id.clone(), job.priority);
            }
        }
        debug!(queue = %self.name, job_id = %id, priority = job.priority, "Enqueued job");
        state.jobs.insert(id.clone(), job);
        Ok(id)
    }

    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        let mut state = self.lock();
        state.promote_due(Utc::now());
        if state.paused {
            return Ok(None);
        }
        while let Some((_, id)) = state.waiting.pop_first() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.start().is_err() {
                continue;
            }
            let job = job.clone();
            state.active.insert(id);
            return Ok(Some(job));
        }
        Ok(None)
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    pub async fn cancel(&self, id: &JobId) -> QueueResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.cancel().is_err() {
            return Ok(false);
        }
        state.remove_waiting(id);
        state.active.remove(id);
        info!(queue = %self.name, job_id = %id, "Cancelled job");
        Ok(true)
    }

    pub async fn retry(&self, id: &JobId) -> QueueResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        if let Err(e) = job.retry() {
            debug!(queue = %self.name, job_id = %id, "Retry rejected: {}", e);
            return Ok(false);
        }
        job.mark_queued()?;
        let priority = job.priority;
        let attempt = job.attempts;
        state.push_waiting(id.clone(), priority);
        info!(queue = %self.name, job_id = %id, attempt, "Requeued job for retry");
        Ok(true)
    }

    pub async fn update_progress(&self, id: &JobId, progress: u8) -> QueueResult<()> {
        let mut state = self.lock();
        state.job_mut(id)?.set_progress(progress);
        Ok(())
    }

    pub async fn heartbeat(&self, id: &JobId) -> QueueResult<()> {
        let mut state = self.lock();
        state.job_mut(id)?.heartbeat();
        Ok(())
    }

    pub async fn complete(
        &self,
        id: &JobId,
        output: JobOutput,
        warnings: Vec<String>,
    ) -> QueueResult<()> {
        let mut state = self.lock();
        let job = state.job_mut(id)?;
        job.complete(output)?;
        for warning in warnings {
            job.add_warning(warning);
        }
        state.active.remove(id);
        Ok(())
    }

    pub async fn fail(&self, id: &JobId, error: &str) -> QueueResult<()> {
        let mut state = self.lock();
        state.job_mut(id)?.fail(error)?;
        state.remove_waiting(id);
        state.active.remove(id);
        Ok(())
    }

    pub async fn is_cancelled(&self, id: &JobId) -> QueueResult<bool> {
        Ok(self
            .lock()
            .jobs
            .get(id)
            .is_some_and(|job| job.cancel_requested || job.status == JobStatus::Cancelled))
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.lock();
        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.count(JobStatus::Completed),
            failed: state.count(JobStatus::Failed),
            delayed: state.delayed.len() as u64,
            cancelled: state.count(JobStatus::Cancelled),
            paused: state.paused,
        })
    }

    pub async fn pause(&self) -> QueueResult<()> {
        self.lock().paused = true;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.lock().paused = false;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        Ok(self.lock().paused)
    }

    pub async fn clean(&self, older_than: Duration, policy: RetentionPolicy) -> QueueResult<u64> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.lock();
        let mut removed = 0u64;

        for (status, keep) in [
            (JobStatus::Completed, policy.keep_completed),
            (JobStatus::Failed, policy.keep_failed),
            (JobStatus::Cancelled, policy.keep_failed),
        ] {
            // Newest first so the keep count retains the most recent jobs.
            let mut finished: Vec<(DateTime<Utc>, JobId)> = state
                .jobs
                .values()
                .filter(|j| j.status == status)
                .map(|j| (j.completed_at.unwrap_or(j.updated_at), j.id.clone()))
                .collect();
            finished.sort_by(|a, b| b.0.cmp(&a.0));

            for (index, (finished_at, id)) in finished.into_iter().enumerate() {
                if finished_at < cutoff || index >= keep {
                    state.jobs.remove(&id);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(queue = %self.name, removed, "Cleaned finished jobs");
        }
        Ok(removed)
    }

    pub async fn recover_stalled(
        &self,
        window: Duration,
        max_stalled: u32,
    ) -> QueueResult<StalledReport> {
        let now = Utc::now();
        let mut report = StalledReport::default();
        let mut state = self.lock();

        let stalled: Vec<JobId> = state
            .active
            .iter()
            .filter(|id| state.jobs.get(*id).is_some_and(|j| j.is_stalled(window, now)))
            .cloned()
            .collect();

        for id in stalled {
            state.active.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.stalled_count < max_stalled && job.attempts < job.max_attempts {
                job.requeue_stalled()?;
                let priority = job.priority;
                warn!(queue = %self.name, job_id = %id, stalled_count = job.stalled_count, "Requeued stalled job");
                state.push_waiting(id.clone(), priority);
                report.requeued.push(id);
            } else {
                job.fail(format!(
                    "job stalled: no heartbeat for {}s",
                    window.as_secs()
                ))?;
                warn!(queue = %self.name, job_id = %id, "Failed stalled job");
                report.failed.push(id);
            }
        }
        Ok(report)
    }

    pub async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
