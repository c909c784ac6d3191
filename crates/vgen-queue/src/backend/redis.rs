//! Redis-backed priority queue.
//!
//! Layout under `{prefix}:{queue}`:
//! - `job:{id}`: job JSON
//! - `wait`: ZSET scored `priority * 2^32 + seq` (lowest first, FIFO within a priority)
//! - `delayed`: ZSET scored by ready time (ms)
//! - `active`: SET of claimed job ids
//! - `completed` / `failed` / `cancelled`: ZSETs scored by finish time (ms)
//! - `seq`: enqueue sequence counter
//! - `paused`: present while the queue is paused
//! - `cancel:{id}`: cancel flag read by the owning worker

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use vgen_models::{Job, JobId, JobOutput, JobPayload, JobStatus};

use crate::config::{EnqueueOptions, QueueStats, RetentionPolicy, StalledReport};
use crate::error::{QueueError, QueueResult};

/// Cancel flags outlive any realistic job.
const CANCEL_FLAG_TTL_SECS: u64 = 24 * 3600;

/// Promotes due delayed jobs, then pops the best waiting job into `active`.
///
/// KEYS: wait, delayed, active, paused, seq. ARGV: now (ms), job key prefix.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local raw = redis.call('GET', ARGV[2] .. id)
  if raw then
    local priority = tonumber(cjson.decode(raw)['priority']) or 10
    local seq = redis.call('INCR', KEYS[5])
    redis.call('ZADD', KEYS[1], string.format('%.0f', priority * 4294967296 + seq), id)
  end
end
if redis.call('EXISTS', KEYS[4]) == 1 then
  return false
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('SADD', KEYS[3], popped[1])
return popped[1]
"#;

#[derive(Debug, Clone)]
struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.base, id)
    }

    fn cancel_flag(&self, id: &JobId) -> String {
        format!("{}:cancel:{}", self.base, id)
    }

    fn named(&self, name: &str) -> String {
        format!("{}:{}", self.base, name)
    }
}

fn wait_score(priority: u32, seq: u64) -> f64 {
    // Exact in f64 while priority < 2^21 and seq < 2^32.
    ((priority as u64) << 32 | (seq & 0xFFFF_FFFF)) as f64
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn finished_millis(job: &Job) -> i64 {
    millis(job.completed_at.unwrap_or(job.updated_at))
}

/// Priority queue stored in Redis; safe to share across processes.
#[derive(Clone)]
pub struct RedisQueue {
    name: String,
    conn: MultiplexedConnection,
    keys: Keys,
    claim: Script,
}

impl RedisQueue {
    pub fn new(conn: MultiplexedConnection, prefix: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            keys: Keys::new(prefix, &name),
            name,
            conn,
            claim: Script::new(CLAIM_SCRIPT),
        }
    }

    /// Open a dedicated connection for one queue.
    pub async fn connect(redis_url: &str, prefix: &str, name: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(Self::new(conn, prefix, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, conn: &mut MultiplexedConnection, id: &JobId) -> QueueResult<Option<Job>> {
        let raw: Option<String> = conn.get(self.keys.job(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_required(&self, conn: &mut MultiplexedConnection, id: &JobId) -> QueueResult<Job> {
        self.load(conn, id).await?.ok_or_else(|| QueueError::not_found(id))
    }

    async fn save(&self, conn: &mut MultiplexedConnection, job: &Job) -> QueueResult<()> {
        let raw = serde_json::to_string(job)?;
        let _: () = conn.set(self.keys.job(&job.id), raw).await?;
        Ok(())
    }

    async fn cancel_flag_set(&self, conn: &mut MultiplexedConnection, id: &JobId) -> QueueResult<bool> {
        Ok(conn.exists(self.keys.cancel_flag(id)).await?)
    }

    async fn next_seq(&self, conn: &mut MultiplexedConnection) -> QueueResult<u64> {
        Ok(conn.incr(self.keys.named("seq"), 1).await?)
    }

    /// Move a cancelled job out of `active` into the cancelled set.
    async fn finalize_cancel(&self, conn: &mut MultiplexedConnection, mut job: Job) -> QueueResult<()> {
        if job.status != JobStatus::Cancelled {
            job.cancel()?;
        }
        let raw = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .set(self.keys.job(&job.id), raw)
            .ignore()
            .srem(self.keys.named("active"), job.id.as_str())
            .ignore()
            .zadd(self.keys.named("cancelled"), job.id.as_str(), finished_millis(&job))
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
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

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        match job.ready_at {
            Some(ready_at) => {
                pipe.zadd(self.keys.named("delayed"), job.id.as_str(), millis(ready_at))
                    .ignore();
            }
            None => {
                job.mark_queued()?;
                let seq = self.next_seq(&mut conn).await?;
                pipe.zadd(self.keys.named("wait"), job.id.as_str(), wait_score(job.priority, seq))
                    .ignore();
            }
        }
        let raw = serde_json::to_string(&job)?;
        pipe.set(self.keys.job(&job.id), raw).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        debug!(queue = %self.name, job_id = %job.id, priority = job.priority, "Enqueued job");
        Ok(job.id)
    }

    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        loop {
            let mut invocation = self.claim.prepare_invoke();
            invocation
                .key(self.keys.named("wait"))
                .key(self.keys.named("delayed"))
                .key(self.keys.named("active"))
                .key(self.keys.named("paused"))
                .key(self.keys.named("seq"))
                .arg(millis(Utc::now()))
                .arg(self.keys.job_prefix());
            let claimed: Option<String> = invocation.invoke_async(&mut conn).await?;
            let Some(id) = claimed else {
                return Ok(None);
            };
            let id = JobId::from_string(id);

            let Some(mut job) = self.load(&mut conn, &id).await? else {
                warn!(queue = %self.name, job_id = %id, "Claimed job has no data, dropping");
                let _: () = conn.srem(self.keys.named("active"), id.as_str()).await?;
                continue;
            };

            // Promoted delayed jobs are still pending in storage.
            if job.status == JobStatus::Pending {
                job.mark_queued()?;
            }
            if job.start().is_err() || self.cancel_flag_set(&mut conn, &id).await? {
                debug!(queue = %self.name, job_id = %id, status = job.status.as_str(), "Skipping claimed job");
                let _: () = conn.srem(self.keys.named("active"), id.as_str()).await?;
                continue;
            }
            self.save(&mut conn, &job).await?;
            return Ok(Some(job));
        }
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, id).await
    }

    pub async fn cancel(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Ok(false);
        };
        if job.cancel().is_err() {
            return Ok(false);
        }

        let raw = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .set_ex(self.keys.cancel_flag(id), 1, CANCEL_FLAG_TTL_SECS)
            .ignore()
            .zrem(self.keys.named("wait"), id.as_str())
            .ignore()
            .zrem(self.keys.named("delayed"), id.as_str())
            .ignore()
            .srem(self.keys.named("active"), id.as_str())
            .ignore()
            .set(self.keys.job(id), raw)
            .ignore()
            .zadd(self.keys.named("cancelled"), id.as_str(), finished_millis(&job))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(queue = %self.name, job_id = %id, "Cancelled job");
        Ok(true)
    }

    pub async fn retry(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Ok(false);
        };
        if let Err(e) = job.retry() {
            debug!(queue = %self.name, job_id = %id, "Retry rejected: {}", e);
            return Ok(false);
        }
        job.mark_queued()?;
        let seq = self.next_seq(&mut conn).await?;

        let raw = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .del(self.keys.cancel_flag(id))
            .ignore()
            .zrem(self.keys.named("failed"), id.as_str())
            .ignore()
            .set(self.keys.job(id), raw)
            .ignore()
            .zadd(self.keys.named("wait"), id.as_str(), wait_score(job.priority, seq))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(queue = %self.name, job_id = %id, attempt = job.attempts, "Requeued job for retry");
        Ok(true)
    }

    pub async fn update_progress(&self, id: &JobId, progress: u8) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut job = self.load_required(&mut conn, id).await?;
        if job.set_progress(progress) && !self.cancel_flag_set(&mut conn, id).await? {
            self.save(&mut conn, &job).await?;
        }
        Ok(())
    }

    pub async fn heartbeat(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut job = self.load_required(&mut conn, id).await?;
        if job.status == JobStatus::Processing && !self.cancel_flag_set(&mut conn, id).await? {
            job.heartbeat();
            self.save(&mut conn, &job).await?;
        }
        Ok(())
    }

    pub async fn complete(
        &self,
        id: &JobId,
        output: JobOutput,
        warnings: Vec<String>,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut job = self.load_required(&mut conn, id).await?;
        job.complete(output)?;
        for warning in warnings {
            job.add_warning(warning);
        }

        let raw = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .set(self.keys.job(id), raw)
            .ignore()
            .srem(self.keys.named("active"), id.as_str())
            .ignore()
            .zadd(self.keys.named("completed"), id.as_str(), finished_millis(&job))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn fail(&self, id: &JobId, error: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut job = self.load_required(&mut conn, id).await?;
        job.fail(error)?;

        let raw = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .set(self.keys.job(id), raw)
            .ignore()
            .srem(self.keys.named("active"), id.as_str())
            .ignore()
            .zrem(self.keys.named("wait"), id.as_str())
            .ignore()
            .zrem(self.keys.named("delayed"), id.as_str())
            .ignore()
            .zadd(self.keys.named("failed"), id.as_str(), finished_millis(&job))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn is_cancelled(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        self.cancel_flag_set(&mut conn, id).await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed, cancelled, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            bool,
        ) = redis::pipe()
            .zcard(self.keys.named("wait"))
            .scard(self.keys.named("active"))
            .zcard(self.keys.named("completed"))
            .zcard(self.keys.named("failed"))
            .zcard(self.keys.named("delayed"))
            .zcard(self.keys.named("cancelled"))
            .exists(self.keys.named("paused"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            cancelled,
            paused,
        })
    }

    pub async fn pause(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.keys.named("paused"), 1).await?;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.keys.named("paused")).await?;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.keys.named("paused")).await?)
    }

    async fn remove_finished(
        &self,
        conn: &mut MultiplexedConnection,
        set: &str,
        ids: &[String],
    ) -> QueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids {
            let id = JobId::from_string(id.clone());
            pipe.del(self.keys.job(&id)).ignore();
            pipe.del(self.keys.cancel_flag(&id)).ignore();
            pipe.zrem(set, id.as_str()).ignore();
        }
        pipe.query_async::<()>(conn).await?;
        Ok(ids.len() as u64)
    }

    pub async fn clean(&self, older_than: Duration, policy: RetentionPolicy) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .map(millis)
            .unwrap_or(i64::MIN);

        let mut removed = 0u64;
        for (name, keep) in [
            ("completed", policy.keep_completed),
            ("failed", policy.keep_failed),
            ("cancelled", policy.keep_failed),
        ] {
            let set = self.keys.named(name);

            let expired: Vec<String> = conn.zrangebyscore(&set, "-inf", format!("({cutoff}")).await?;
            removed += self.remove_finished(&mut conn, &set, &expired).await?;

            let count: usize = conn.zcard(&set).await?;
            if count > keep {
                // Oldest entries have the lowest scores.
                let excess: Vec<String> = conn.zrange(&set, 0, (count - keep - 1) as isize).await?;
                removed += self.remove_finished(&mut conn, &set, &excess).await?;
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
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let mut report = StalledReport::default();

        let members: Vec<String> = conn.smembers(self.keys.named("active")).await?;
        for member in members {
            let id = JobId::from_string(member);
            let Some(mut job) = self.load(&mut conn, &id).await? else {
                let _: () = conn.srem(self.keys.named("active"), id.as_str()).await?;
                continue;
            };

            // A progress write can race a cancel; the flag wins.
            if self.cancel_flag_set(&mut conn, &id).await? && !job.status.is_terminal() {
                self.finalize_cancel(&mut conn, job).await?;
                continue;
            }
            if !job.is_stalled(window, now) {
                continue;
            }

            if job.stalled_count < max_stalled && job.attempts < job.max_attempts {
                job.requeue_stalled()?;
                let seq = self.next_seq(&mut conn).await?;
                let raw = serde_json::to_string(&job)?;
                redis::pipe()
                    .atomic()
                    .set(self.keys.job(&id), raw)
                    .ignore()
                    .srem(self.keys.named("active"), id.as_str())
                    .ignore()
                    .zadd(self.keys.named("wait"), id.as_str(), wait_score(job.priority, seq))
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                warn!(queue = %self.name, job_id = %id, stalled_count = job.stalled_count, "Requeued stalled job");
                report.requeued.push(id);
            } else {
                self.fail(&id, &format!("job stalled: no heartbeat for {}s", window.as_secs()))
                    .await?;
                warn!(queue = %self.name, job_id = %id, "Failed stalled job");
                report.failed.push(id);
            }
        }
        Ok(report)
    }

    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("name", &self.name)
            .field("keys", &self.keys.base)
            .finish()
    }
}
