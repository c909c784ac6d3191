//! Long-running operation poller.
//!
//! Each polled operation gets a session with exactly one timer task. The task
//! sleeps, queries the [`OperationStatusSource`], and emits [`PollEvent`]s on a
//! channel owned by the caller's [`PollSubscription`]. A session ends on
//! completion, failure, timeout, explicit stop, or staleness, and its entry is
//! removed from the session map before the final event is sent.
//!
//! Every session ends within `min(initial_interval, max_interval) + max_polls * max_interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::OperationStatusSource;
use crate::types::OperationResult;

const EVENT_BUFFER: usize = 64;

/// Polling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    /// Delay before the first status check
    pub initial_interval: Duration,
    /// Upper bound for the interval
    pub max_interval: Duration,
    /// Growth factor applied after each in-progress response
    pub backoff_factor: f64,
    /// Status checks allowed before the session times out
    pub max_polls: u32,
    /// Consecutive transient errors tolerated
    pub error_retry_limit: u32,
    /// Age after which the sweeper force-stops a session
    pub stale_after: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            backoff_factor: 1.1,
            max_polls: 360,
            error_retry_limit: 5,
            stale_after: Duration::from_secs(3600),
        }
    }
}

impl PollOptions {
    /// Create options from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            initial_interval: secs("POLL_INITIAL_INTERVAL_SECS", defaults.initial_interval),
            max_interval: secs("POLL_MAX_INTERVAL_SECS", defaults.max_interval),
            backoff_factor: std::env::var("POLL_BACKOFF_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|f: &f64| *f >= 1.0)
                .unwrap_or(defaults.backoff_factor),
            max_polls: std::env::var("POLL_MAX_POLLS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_polls),
            error_retry_limit: std::env::var("POLL_ERROR_RETRY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.error_retry_limit),
            stale_after: secs("POLL_STALE_AFTER_SECS", defaults.stale_after),
        }
    }

    /// Worst-case time from `start_polling` to the final event.
    pub fn termination_bound(&self) -> Duration {
        self.first_interval()
            .saturating_add(self.max_interval.saturating_mul(self.max_polls))
    }

    /// Delay before the first status check, capped by `max_interval`.
    fn first_interval(&self) -> Duration {
        self.initial_interval.min(self.max_interval)
    }

    fn next_interval(&self, current: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * factor.max(1.0))
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Why a session ended without a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("operation still running after {polls} status checks")]
    Timeout { polls: u32 },

    #[error("operation failed: {message}")]
    OperationFailed { message: String, permanent: bool },

    #[error("{consecutive} consecutive status errors, last: {last_error}")]
    TooManyErrors { consecutive: u32, last_error: String },

    #[error("polling stopped")]
    Stopped,

    #[error("polling session exceeded its maximum age")]
    Stale,
}

/// Event delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Progress {
        operation_id: String,
        /// Service-reported progress (0-100), when available
        progress: Option<u8>,
        poll_count: u32,
    },
    Complete {
        operation_id: String,
        result: OperationResult,
    },
    Error {
        operation_id: String,
        error: PollError,
    },
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Started,
    Polling,
    Completed,
    Failed,
    TimedOut,
    Stopped,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Started | PollState::Polling)
    }
}

/// Snapshot of a live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub operation_id: String,
    pub poll_count: u32,
    pub current_interval: Duration,
    pub started_at: Instant,
    pub consecutive_errors: u32,
    pub state: PollState,
}

struct SessionHandle {
    generation: u64,
    info: SessionInfo,
    stale_after: Duration,
    events: mpsc::Sender<PollEvent>,
    task: JoinHandle<()>,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionHandle>>>;

/// Receiving end of a polling session.
///
/// Dropping the subscription (or calling [`PollSubscription::unsubscribe`])
/// stops the session it was created for.
pub struct PollSubscription {
    operation_id: String,
    generation: u64,
    events: mpsc::Receiver<PollEvent>,
    sessions: SessionMap,
}

impl PollSubscription {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Next event; `None` once the session has ended and all events were read.
    pub async fn recv(&mut self) -> Option<PollEvent> {
        self.events.recv().await
    }

    /// Stop the session and discard pending events.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        if remove_session(&self.sessions, &self.operation_id, Some(self.generation), true) {
            debug!(operation_id = %self.operation_id, "Subscription dropped, polling stopped");
        }
    }
}

/// Outcome of [`OperationPoller::poll_multiple`].
#[derive(Debug, Default)]
pub struct BatchPollReport {
    pub results: HashMap<String, Result<OperationResult, PollError>>,
}

impl BatchPollReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Polls long-running render operations until they finish.
#[derive(Clone)]
pub struct OperationPoller {
    source: Arc<dyn OperationStatusSource>,
    sessions: SessionMap,
    generations: Arc<AtomicU64>,
}

impl OperationPoller {
    pub fn new(source: Arc<dyn OperationStatusSource>) -> Self {
        Self {
            source,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start polling `operation_id`, replacing any session already polling it.
    pub fn start_polling(&self, operation_id: &str, options: PollOptions) -> PollSubscription {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let operation_id = operation_id.to_string();

        let info = SessionInfo {
            operation_id: operation_id.clone(),
            poll_count: 0,
            current_interval: options.first_interval(),
            started_at: Instant::now(),
            consecutive_errors: 0,
            state: PollState::Started,
        };

        {
            // Insert under the lock so the task cannot finish before its entry exists
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let task = tokio::spawn(run_session(
                self.source.clone(),
                self.sessions.clone(),
                operation_id.clone(),
                generation,
                options.clone(),
                tx.clone(),
            ));
            let previous = sessions.insert(
                operation_id.clone(),
                SessionHandle {
                    generation,
                    info,
                    stale_after: options.stale_after,
                    events: tx,
                    task,
                },
            );
            if let Some(previous) = previous {
                previous.task.abort();
                info!(operation_id = %operation_id, "Replaced existing polling session");
            }
        }

        debug!(operation_id = %operation_id, generation, "Polling started");

        PollSubscription {
            operation_id,
            generation,
            events: rx,
            sessions: self.sessions.clone(),
        }
    }

    /// Stop polling; returns whether a session was running. Idempotent.
    pub fn stop_polling(&self, operation_id: &str) -> bool {
        let stopped = remove_session(&self.sessions, operation_id, None, true);
        if stopped {
            info!(operation_id, "Polling stopped");
        }
        stopped
    }

    /// Force-stop sessions older than their `stale_after`; returns their ids.
    pub fn sweep_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<(String, mpsc::Sender<PollEvent>)> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, h)| now.duration_since(h.info.started_at) > h.stale_after)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    sessions.remove(&id).map(|handle| {
                        handle.task.abort();
                        (id, handle.events)
                    })
                })
                .collect()
        };

        for (operation_id, events) in &stale {
            warn!(operation_id = %operation_id, "Stale polling session force-stopped");
            let _ = events.try_send(PollEvent::Error {
                operation_id: operation_id.clone(),
                error: PollError::Stale,
            });
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Run [`OperationPoller::sweep_stale`] every `every` until shutdown.
    pub fn spawn_stale_sweeper(
        &self,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = poller.sweep_stale();
                        if !swept.is_empty() {
                            info!(count = swept.len(), "Swept stale polling sessions");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Stale session sweeper stopped");
        })
    }

    /// Poll until the operation reaches a terminal state.
    pub async fn poll_until_complete(
        &self,
        operation_id: &str,
        options: PollOptions,
    ) -> Result<OperationResult, PollError> {
        let mut subscription = self.start_polling(operation_id, options);
        while let Some(event) = subscription.recv().await {
            match event {
                PollEvent::Complete { result, .. } => return Ok(result),
                PollEvent::Error { error, .. } => return Err(error),
                PollEvent::Progress { .. } => {}
            }
        }
        Err(PollError::Stopped)
    }

    /// Poll several operations concurrently; one failure does not affect the others.
    pub async fn poll_multiple(&self, operation_ids: &[String], options: PollOptions) -> BatchPollReport {
        let polls = operation_ids.iter().map(|id| {
            let options = options.clone();
            async move { (id.clone(), self.poll_until_complete(id, options).await) }
        });

        BatchPollReport {
            results: join_all(polls).await.into_iter().collect(),
        }
    }

    /// Ids of operations currently being polled.
    pub fn active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.keys().cloned().collect()
    }

    pub fn session_info(&self, operation_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(operation_id).map(|h| h.info.clone())
    }
}

/// Remove a session entry (optionally only a specific generation).
fn remove_session(
    sessions: &SessionMap,
    operation_id: &str,
    generation: Option<u64>,
    abort: bool,
) -> bool {
    let mut sessions = sessions.write().unwrap_or_else(|e| e.into_inner());
    let matches = sessions
        .get(operation_id)
        .is_some_and(|h| generation.map_or(true, |g| h.generation == g));
    if !matches {
        return false;
    }
    match sessions.remove(operation_id) {
        Some(handle) => {
            if abort {
                handle.task.abort();
            }
            true
        }
        None => false,
    }
}

fn update_info(
    sessions: &SessionMap,
    operation_id: &str,
    generation: u64,
    update: impl FnOnce(&mut SessionInfo),
) {
    let mut sessions = sessions.write().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = sessions.get_mut(operation_id) {
        if handle.generation == generation {
            update(&mut handle.info);
        }
    }
}

async fn run_session(
    source: Arc<dyn OperationStatusSource>,
    sessions: SessionMap,
    operation_id: String,
    generation: u64,
    options: PollOptions,
    events: mpsc::Sender<PollEvent>,
) {
    let mut interval = options.first_interval();
    let mut poll_count: u32 = 0;
    let mut consecutive_errors: u32 = 0;

    // Ends the session: entry first, then the final event.
    let finish = |state: PollState, event: PollEvent| {
        let sessions = sessions.clone();
        let events = events.clone();
        let operation_id = operation_id.clone();
        async move {
            remove_session(&sessions, &operation_id, Some(generation), false);
            debug!(operation_id = %operation_id, ?state, "Polling session ended");
            let _ = events.send(event).await;
        }
    };

    loop {
        tokio::time::sleep(interval).await;
        poll_count += 1;

        if poll_count > options.max_polls {
            warn!(operation_id = %operation_id, polls = options.max_polls, "Polling timed out");
            finish(
                PollState::TimedOut,
                PollEvent::Error {
                    operation_id: operation_id.clone(),
                    error: PollError::Timeout {
                        polls: options.max_polls,
                    },
                },
            )
            .await;
            return;
        }

        update_info(&sessions, &operation_id, generation, |info| {
            info.state = PollState::Polling;
            info.poll_count = poll_count;
        });

        match source.status(&operation_id).await {
            Ok(status) => {
                consecutive_errors = 0;

                let failure = status
                    .error
                    .as_ref()
                    .filter(|e| status.done || e.permanent)
                    .map(|e| (e.message.clone(), e.permanent));

                if let Some((message, permanent)) = failure {
                    warn!(operation_id = %operation_id, %message, permanent, "Operation failed");
                    finish(
                        PollState::Failed,
                        PollEvent::Error {
                            operation_id: operation_id.clone(),
                            error: PollError::OperationFailed { message, permanent },
                        },
                    )
                    .await;
                    return;
                }

                if status.done {
                    let event = match status.result {
                        Some(result) => {
                            info!(operation_id = %operation_id, poll_count, "Operation completed");
                            (
                                PollState::Completed,
                                PollEvent::Complete {
                                    operation_id: operation_id.clone(),
                                    result,
                                },
                            )
                        }
                        None => (
                            PollState::Failed,
                            PollEvent::Error {
                                operation_id: operation_id.clone(),
                                error: PollError::OperationFailed {
                                    message: "operation finished without a result".to_string(),
                                    permanent: true,
                                },
                            },
                        ),
                    };
                    finish(event.0, event.1).await;
                    return;
                }

                interval = options.next_interval(interval, options.backoff_factor);
                update_info(&sessions, &operation_id, generation, |info| {
                    info.current_interval = interval;
                    info.consecutive_errors = 0;
                });

                let progress = PollEvent::Progress {
                    operation_id: operation_id.clone(),
                    progress: status.progress.map(|p| p.min(100)),
                    poll_count,
                };
                if events.send(progress).await.is_err() {
                    // Subscriber went away
                    remove_session(&sessions, &operation_id, Some(generation), false);
                    return;
                }
            }
            Err(e) if e.is_permanent() => {
                warn!(operation_id = %operation_id, error = %e, "Operation rejected");
                finish(
                    PollState::Failed,
                    PollEvent::Error {
                        operation_id: operation_id.clone(),
                        error: PollError::OperationFailed {
                            message: e.to_string(),
                            permanent: true,
                        },
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    operation_id = %operation_id,
                    consecutive_errors,
                    error = %e,
                    "Status check failed"
                );

                if consecutive_errors > options.error_retry_limit {
                    finish(
                        PollState::Failed,
                        PollEvent::Error {
                            operation_id: operation_id.clone(),
                            error: PollError::TooManyErrors {
                                consecutive: consecutive_errors,
                                last_error: e.to_string(),
                            },
                        },
                    )
                    .await;
                    return;
                }

                interval = options.next_interval(interval, 2.0);
                update_info(&sessions, &operation_id, generation, |info| {
                    info.current_interval = interval;
                    info.consecutive_errors = consecutive_errors;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{RenderError, RenderResult};
    use crate::types::OperationStatus;

    enum Step {
        Status(OperationStatus),
        Transient,
        Permanent,
    }

    /// Replays scripted responses; repeats the last step once exhausted.
    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OperationStatusSource for ScriptedSource {
        async fn status(&self, _operation_id: &str) -> RenderResult<OperationStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut steps = self.steps.lock().unwrap();
            let step = if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                match steps.front().unwrap() {
                    Step::Status(s) => Step::Status(s.clone()),
                    Step::Transient => Step::Transient,
                    Step::Permanent => Step::Permanent,
                }
            };
            match step {
                Step::Status(s) => Ok(s),
                Step::Transient => Err(RenderError::unavailable("503 Service Unavailable")),
                Step::Permanent => Err(RenderError::permanent("422: prompt rejected")),
            }
        }
    }

    fn result() -> OperationResult {
        OperationResult {
            video_uri: "https://cdn.example.com/op.mp4".to_string(),
            mime_type: Some("video/mp4".to_string()),
            duration_secs: Some(5.0),
        }
    }

    fn fast_options() -> PollOptions {
        PollOptions {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(4),
            max_polls: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = PollOptions::default();
        assert_eq!(options.initial_interval, Duration::from_secs(5));
        assert_eq!(options.max_interval, Duration::from_secs(30));
        assert_eq!(options.max_polls, 360);
        assert_eq!(options.error_retry_limit, 5);
        assert_eq!(
            options.termination_bound(),
            Duration::from_secs(5 + 360 * 30)
        );
    }

    #[test]
    fn test_termination_bound_saturates() {
        let options = PollOptions {
            initial_interval: Duration::MAX,
            max_interval: Duration::from_secs(u64::MAX / 2),
            max_polls: u32::MAX,
            ..Default::default()
        };
        assert_eq!(options.termination_bound(), Duration::MAX);
        assert_eq!(
            options.next_interval(Duration::MAX, 2.0),
            options.max_interval
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_interval_capped_by_max() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::succeeded(result()))]);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            initial_interval: Duration::from_secs(600),
            max_interval: Duration::from_secs(2),
            max_polls: 1,
            ..Default::default()
        };
        assert_eq!(options.termination_bound(), Duration::from_secs(4));

        let started = Instant::now();
        let mut sub = poller.start_polling("op-cap", options.clone());
        assert_eq!(
            poller.session_info("op-cap").unwrap().current_interval,
            Duration::from_secs(2)
        );
        assert!(matches!(sub.recv().await, Some(PollEvent::Complete { .. })));
        assert!(started.elapsed() >= Duration::from_secs(2) && started.elapsed() < Duration::from_secs(3));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_then_complete() {
        let mut steps: Vec<Step> = [0, 20, 40, 60, 80, 100]
            .into_iter()
            .map(|p| Step::Status(OperationStatus::in_progress(p)))
            .collect();
        steps.push(Step::Status(OperationStatus::succeeded(result())));
        let source = ScriptedSource::new(steps);
        let poller = OperationPoller::new(source.clone());

        let mut sub = poller.start_polling("op-a", fast_options());
        let mut progress = Vec::new();
        let completed = loop {
            match sub.recv().await.unwrap() {
                PollEvent::Progress { progress: p, .. } => progress.push(p.unwrap()),
                PollEvent::Complete { result, .. } => break result,
                PollEvent::Error { error, .. } => panic!("unexpected error: {error}"),
            }
        };

        assert_eq!(progress, vec![0, 20, 40, 60, 80, 100]);
        assert_eq!(completed, result());
        assert_eq!(source.calls(), 7);
        assert!(poller.active_sessions().is_empty());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_on_first_poll() {
        let source = ScriptedSource::new(vec![Step::Permanent]);
        let poller = OperationPoller::new(source.clone());

        let err = poller
            .poll_until_complete("op-c", fast_options())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::OperationFailed { permanent: true, .. }));
        assert_eq!(source.calls(), 1);
        assert!(poller.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_payload_is_not_retried() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::failed(
            "content policy violation",
            true,
        ))]);
        let poller = OperationPoller::new(source.clone());

        let err = poller.poll_until_complete("op-c2", fast_options()).await.unwrap_err();
        assert_eq!(
            err,
            PollError::OperationFailed {
                message: "content policy violation".to_string(),
                permanent: true
            }
        );
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_transient_errors_exceed_limit() {
        let source = ScriptedSource::new(vec![Step::Transient]);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            error_retry_limit: 5,
            ..fast_options()
        };

        let started = Instant::now();
        let err = poller.poll_until_complete("op-d", options.clone()).await.unwrap_err();

        assert!(matches!(err, PollError::TooManyErrors { consecutive: 6, .. }));
        assert_eq!(source.calls(), 6);
        assert!(poller.session_info("op-d").is_none());
        assert!(started.elapsed() <= options.termination_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_counter_resets_on_success() {
        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(Step::Transient);
            steps.push(Step::Transient);
            steps.push(Step::Status(OperationStatus::in_progress(10)));
        }
        steps.push(Step::Status(OperationStatus::succeeded(result())));
        let source = ScriptedSource::new(steps);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            error_retry_limit: 2,
            ..fast_options()
        };

        assert!(poller.poll_until_complete("op-r", options).await.is_ok());
        assert_eq!(source.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_max_polls() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(50))]);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            max_polls: 3,
            ..fast_options()
        };

        let started = Instant::now();
        let err = poller.poll_until_complete("op-t", options.clone()).await.unwrap_err();

        assert_eq!(err, PollError::Timeout { polls: 3 });
        assert_eq!(source.calls(), 3);
        assert!(started.elapsed() <= options.termination_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_backs_off_to_max() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(5))]);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(12),
            backoff_factor: 1.1,
            ..Default::default()
        };

        let mut sub = poller.start_polling("op-b", options);
        sub.recv().await.unwrap();
        let info = poller.session_info("op-b").unwrap();
        assert_eq!(info.poll_count, 1);
        assert_eq!(info.current_interval, Duration::from_secs(11));
        assert_eq!(info.state, PollState::Polling);

        sub.recv().await.unwrap();
        sub.recv().await.unwrap();
        let info = poller.session_info("op-b").unwrap();
        assert_eq!(info.current_interval, Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_polling_is_idempotent() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(5))]);
        let poller = OperationPoller::new(source.clone());

        let mut sub = poller.start_polling("op-s", fast_options());
        assert_eq!(poller.active_sessions(), vec!["op-s".to_string()]);

        assert!(poller.stop_polling("op-s"));
        assert!(!poller.stop_polling("op-s"));
        assert!(sub.recv().await.is_none());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_subscription_stops_session() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(5))]);
        let poller = OperationPoller::new(source.clone());

        let sub = poller.start_polling("op-u", fast_options());
        sub.unsubscribe();
        assert!(poller.active_sessions().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_session() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(5))]);
        let poller = OperationPoller::new(source.clone());

        let mut first = poller.start_polling("op-x", fast_options());
        let mut second = poller.start_polling("op-x", fast_options());
        assert_eq!(poller.active_sessions().len(), 1);

        // The replaced session's task was aborted, so its channel closes.
        assert!(first.recv().await.is_none());
        assert!(matches!(second.recv().await, Some(PollEvent::Progress { .. })));

        // Dropping the stale subscription must not stop the new session.
        drop(first);
        assert_eq!(poller.active_sessions(), vec!["op-x".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stale_sessions() {
        let source = ScriptedSource::new(vec![Step::Status(OperationStatus::in_progress(5))]);
        let poller = OperationPoller::new(source.clone());
        let options = PollOptions {
            initial_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(30),
            ..Default::default()
        };

        let mut sub = poller.start_polling("op-old", options);
        assert!(poller.sweep_stale().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(poller.sweep_stale(), vec!["op-old".to_string()]);
        assert!(poller.active_sessions().is_empty());
        assert_eq!(
            sub.recv().await,
            Some(PollEvent::Error {
                operation_id: "op-old".to_string(),
                error: PollError::Stale
            })
        );
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_multiple_isolates_failures() {
        struct ById;

        #[async_trait]
        impl OperationStatusSource for ById {
            async fn status(&self, operation_id: &str) -> RenderResult<OperationStatus> {
                if operation_id == "bad" {
                    Err(RenderError::permanent("404 Not Found"))
                } else {
                    Ok(OperationStatus::succeeded(OperationResult {
                        video_uri: format!("https://cdn.example.com/{operation_id}.mp4"),
                        mime_type: None,
                        duration_secs: None,
                    }))
                }
            }
        }

        let poller = OperationPoller::new(Arc::new(ById));
        let ids = vec!["good-1".to_string(), "bad".to_string(), "good-2".to_string()];
        let report = poller.poll_multiple(&ids, fast_options()).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.results["bad"].is_err());
    }
}
