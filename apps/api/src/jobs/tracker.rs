//! Background job tracker. Follows one remote job until it finishes, fails, or the
//! observation window runs out.
//!
//! One tracker owns at most one poll loop. The loop runs as a tokio task: it polls the
//! Remote Job Service, publishes the result, then sleeps for the poll interval. Polls are
//! strictly sequential, including across `start` calls: a new loop does not issue its first
//! poll until the previous loop's task has exited.
//!
//! State is published through a `watch` channel and to callback observers. Every loop
//! carries a generation number; a loop whose generation is no longer current can never
//! publish, so a superseded or stopped loop cannot overwrite newer state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::jobs::store::SnapshotStore;
use crate::models::job::{Job, Phase};
use crate::remote::{JobService, RemoteError};

#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("poll interval must be positive")]
    ZeroInterval,

    #[error("timeout must be positive")]
    ZeroTimeout,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    /// Nothing is being tracked.
    Idle,
    Polling,
    Completed,
    Failed,
    /// Observation window elapsed; the job may still be running remotely.
    TimedOut,
    Stopped,
}

impl TrackerStatus {
    /// True once the loop has ended for any reason.
    pub fn is_final(self) -> bool {
        !matches!(self, TrackerStatus::Idle | TrackerStatus::Polling)
    }
}

/// Everything an observer can see about the tracked job. Replaced as a whole on every update.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerState {
    pub status: TrackerStatus,
    pub job_id: Option<String>,
    /// Last successfully fetched snapshot.
    pub job: Option<Job>,
    pub polls: u32,
    pub failed_polls: u32,
    /// Error from the most recent poll, cleared by the next success.
    pub last_error: Option<String>,
    pub tracking_started_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            status: TrackerStatus::Idle,
            job_id: None,
            job: None,
            polls: 0,
            failed_polls: 0,
            last_error: None,
            tracking_started_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

type Observer = Arc<dyn Fn(&TrackerState) + Send + Sync>;

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
    refresh: Arc<Notify>,
}

#[derive(Default)]
struct LoopSlot {
    active: Option<ActiveLoop>,
    // Task of the most recent loop, awaited by the next one before it polls.
    last_task: Option<JoinHandle<()>>,
}

struct Inner {
    service: Arc<dyn JobService>,
    store: Arc<dyn SnapshotStore>,
    terminal_ttl: Duration,
    state_tx: watch::Sender<TrackerState>,
    slot: Mutex<LoopSlot>,
    generation: AtomicU64,
    visible: AtomicBool,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
}

/// Cheap to clone; all clones drive the same tracker.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<Inner>,
}

/// Keeps a callback registered. Dropping it (or calling `unsubscribe`) removes the callback.
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            match inner.observers.lock() {
                Ok(mut observers) => observers.retain(|(id, _)| *id != self.id),
                Err(e) => tracing::error!("Mutex poisoned removing observer: {e}"),
            }
        }
    }
}

enum PollFlow {
    Continue,
    Finished,
}

impl JobTracker {
    /// `terminal_ttl` is how long a finished job stays in the session mirror.
    pub fn new(
        service: Arc<dyn JobService>,
        store: Arc<dyn SnapshotStore>,
        terminal_ttl: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(TrackerState::default());
        Self {
            inner: Arc::new(Inner {
                service,
                store,
                terminal_ttl,
                state_tx,
                slot: Mutex::new(LoopSlot::default()),
                generation: AtomicU64::new(0),
                visible: AtomicBool::new(true),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// Begins tracking `job_id`, replacing any loop that is still running.
    ///
    /// The first poll is issued immediately, then one poll per `poll_interval` until the
    /// job reaches a terminal phase, `timeout` has elapsed, or `stop` is called.
    pub fn start(
        &self,
        job_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<(), TrackerError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(TrackerError::EmptyJobId);
        }
        if poll_interval.is_zero() {
            return Err(TrackerError::ZeroInterval);
        }
        if timeout.is_zero() {
            return Err(TrackerError::ZeroTimeout);
        }

        let inner = &self.inner;
        let mut slot = inner.lock_slot();

        if let Some(previous) = slot.active.take() {
            debug!("Replacing active tracking loop (generation {})", previous.generation);
            previous.cancel.cancel();
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let refresh = Arc::new(Notify::new());

        // Published before the loop exists so its first poll cannot be overwritten.
        let now = Instant::now();
        inner.state_tx.send_modify(|state| {
            // Resuming the same job keeps the last known snapshot on screen.
            let job = state.job.take().filter(|j| j.id == job_id);
            *state = TrackerState {
                status: TrackerStatus::Polling,
                job_id: Some(job_id.to_string()),
                job,
                tracking_started_at: Some(Utc::now()),
                started_at: Some(now),
                ..TrackerState::default()
            };
        });

        let session = Uuid::new_v4();
        let span = tracing::info_span!("job_tracking", job_id = %job_id, session = %session);
        let task = tokio::spawn(
            run_loop(
                Arc::clone(inner),
                slot.last_task.take(),
                LoopParams {
                    generation,
                    job_id: job_id.to_string(),
                    poll_interval,
                    timeout,
                    started: now,
                    cancel: cancel.clone(),
                    refresh: Arc::clone(&refresh),
                },
            )
            .instrument(span),
        );

        slot.active = Some(ActiveLoop {
            generation,
            cancel,
            refresh,
        });
        slot.last_task = Some(task);
        drop(slot);

        // Observers may call back into the tracker, so the slot lock is released first.
        inner.notify_observers();
        info!(
            "Tracking job {job_id} every {}ms for up to {}ms",
            poll_interval.as_millis(),
            timeout.as_millis()
        );
        Ok(())
    }

    /// Stops the active loop, if any. Safe to call repeatedly, while idle, or from an observer.
    pub fn stop(&self) {
        let inner = &self.inner;
        let active = inner.lock_slot().active.take();
        let Some(active) = active else {
            return;
        };

        active.cancel.cancel();
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.state_tx.send_modify(|state| {
            state.status = TrackerStatus::Stopped;
            state.finished_at = Some(Instant::now());
        });
        inner.notify_observers();
        info!("Stopped tracking loop (generation {})", active.generation);
    }

    /// Stops tracking, forgets the job, and removes it from the session mirror.
    pub async fn clear(&self) {
        let inner = &self.inner;
        let (active, last_task) = {
            let mut slot = inner.lock_slot();
            (slot.active.take(), slot.last_task.take())
        };
        if let Some(active) = active {
            active.cancel.cancel();
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.state_tx.send_replace(TrackerState::default());
        inner.notify_observers();

        // A cancelled loop can still be finishing a mirror write; the delete must land after it.
        if let Some(task) = last_task {
            let _ = task.await;
        }
        if let Err(e) = inner.store.clear().await {
            warn!("Failed to clear mirrored job: {e}");
        }
    }

    /// Reports client visibility. Coming back from hidden while a loop is active triggers
    /// one immediate poll; the regular schedule is left as is.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.inner.visible.swap(visible, Ordering::SeqCst);
        if !visible || was_visible {
            return;
        }
        let slot = self.inner.lock_slot();
        if let Some(active) = &slot.active {
            debug!("Client visible again, requesting out-of-cycle poll");
            active.refresh.notify_one();
        }
    }

    /// Loads the mirrored job after a restart and shows it while idle.
    ///
    /// Tracking is not resumed; callers that want fresh data start a new loop.
    pub async fn restore(&self) -> Option<Job> {
        let job = match self.inner.store.load().await {
            Ok(job) => job?,
            Err(e) => {
                warn!("Failed to load mirrored job: {e}");
                return None;
            }
        };

        let restored = self.inner.state_tx.send_if_modified(|state| {
            if state.status != TrackerStatus::Idle {
                return false;
            }
            state.status = match job.phase {
                Phase::Completed => TrackerStatus::Completed,
                Phase::Failed => TrackerStatus::Failed,
                Phase::Pending | Phase::Running => TrackerStatus::Idle,
            };
            state.job_id = Some(job.id.clone());
            state.job = Some(job.clone());
            true
        });
        if restored {
            info!("Restored mirrored job {} ({})", job.id, job.phase.as_str());
            self.inner.notify_observers();
        }
        Some(job)
    }

    pub fn snapshot(&self) -> TrackerState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TrackerState> {
        self.inner.state_tx.subscribe()
    }

    /// Registers a callback invoked with every new state, on the task that produced it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TrackerState) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        match self.inner.observers.lock() {
            Ok(mut observers) => observers.push((id, Arc::new(callback))),
            Err(e) => tracing::error!("Mutex poisoned adding observer: {e}"),
        }
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_slot().active.is_some()
    }
}

impl Inner {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, LoopSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Mutex poisoned on loop slot, recovering");
            poisoned.into_inner()
        })
    }

    /// Applies `update` only if `generation` is still current. Returns whether it did.
    fn publish(&self, generation: u64, update: impl FnOnce(&mut TrackerState)) -> bool {
        let published = self.state_tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            update(state);
            true
        });
        if published {
            self.notify_observers();
        }
        published
    }

    fn notify_observers(&self) {
        // Clone first: callbacks may subscribe, unsubscribe, or stop the tracker.
        let observers: Vec<Observer> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(e) => {
                tracing::error!("Mutex poisoned reading observers: {e}");
                return;
            }
        };
        if observers.is_empty() {
            return;
        }
        let state = self.state_tx.borrow().clone();
        for observer in observers {
            observer(&state);
        }
    }

    fn release_slot(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.active.as_ref().map(|a| a.generation) == Some(generation) {
            slot.active = None;
        }
    }

    async fn handle_poll(
        &self,
        generation: u64,
        job_id: &str,
        result: Result<Job, RemoteError>,
    ) -> PollFlow {
        let job = match result {
            Ok(job) => job,
            Err(e) => {
                warn!("Status poll for job {job_id} failed: {e}");
                let error = e.to_string();
                let published = self.publish(generation, |state| {
                    state.polls += 1;
                    state.failed_polls += 1;
                    state.last_error = Some(error);
                });
                return if published {
                    PollFlow::Continue
                } else {
                    PollFlow::Finished
                };
            }
        };

        if job.id != job_id {
            debug!("Status for {job_id} reported id {}", job.id);
        }
        if let Some((processed, total)) = job.processed_of_total() {
            debug!("Job {job_id} {}: {processed}/{total}", job.phase.as_str());
        }

        let status = match job.phase {
            Phase::Completed => TrackerStatus::Completed,
            Phase::Failed => TrackerStatus::Failed,
            Phase::Pending | Phase::Running => TrackerStatus::Polling,
        };
        let terminal = job.is_terminal();

        if terminal {
            // Free the slot before observers run so they see an inactive tracker.
            self.release_slot(generation);
        }
        let published = self.publish(generation, |state| {
            state.status = status;
            state.job = Some(job.clone());
            state.polls += 1;
            state.last_error = None;
            if terminal {
                state.finished_at = Some(Instant::now());
            }
        });
        if !published {
            return PollFlow::Finished;
        }

        let ttl = terminal.then_some(self.terminal_ttl);
        if let Err(e) = self.store.save(&job, ttl).await {
            warn!("Failed to mirror job {job_id}: {e}");
        }

        if terminal {
            match job.phase {
                Phase::Failed => warn!(
                    "Job {job_id} failed: {}",
                    if job.errors.is_empty() {
                        "no error reported".to_string()
                    } else {
                        job.errors.join("; ")
                    }
                ),
                _ => info!("Job {job_id} completed"),
            }
            return PollFlow::Finished;
        }
        PollFlow::Continue
    }

    fn time_out(&self, generation: u64, job_id: &str, elapsed: Duration) {
        self.release_slot(generation);
        let published = self.publish(generation, |state| {
            state.status = TrackerStatus::TimedOut;
            state.finished_at = Some(Instant::now());
        });
        if published {
            info!(
                "Stopped tracking job {job_id} after {}ms; it may still be running",
                elapsed.as_millis()
            );
        }
    }
}

struct LoopParams {
    generation: u64,
    job_id: String,
    poll_interval: Duration,
    timeout: Duration,
    started: Instant,
    cancel: CancellationToken,
    refresh: Arc<Notify>,
}

/// Polls once unless cancelled first; an in-flight request is dropped on cancellation.
async fn poll_once(inner: &Inner, params: &LoopParams) -> Option<PollFlow> {
    let result = tokio::select! {
        biased;
        _ = params.cancel.cancelled() => return None,
        result = inner.service.get_status(&params.job_id) => result,
    };
    let flow = inner
        .handle_poll(params.generation, &params.job_id, result)
        .await;
    if params.cancel.is_cancelled() {
        return None;
    }
    Some(flow)
}

async fn run_loop(inner: Arc<Inner>, previous: Option<JoinHandle<()>>, params: LoopParams) {
    if let Some(previous) = previous {
        // Already cancelled; waits out any request it still has in flight.
        let _ = previous.await;
    }

    loop {
        match poll_once(&inner, &params).await {
            Some(PollFlow::Continue) => {}
            Some(PollFlow::Finished) | None => return,
        }
        let elapsed = params.started.elapsed();
        if elapsed > params.timeout {
            inner.time_out(params.generation, &params.job_id, elapsed);
            return;
        }

        let tick = sleep(params.poll_interval);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                biased;
                _ = params.cancel.cancelled() => return,
                _ = &mut tick => break,
                _ = params.refresh.notified() => {
                    let elapsed = params.started.elapsed();
                    if elapsed > params.timeout {
                        inner.time_out(params.generation, &params.job_id, elapsed);
                        return;
                    }
                    debug!("Out-of-cycle poll for job {}", params.job_id);
                    match poll_once(&inner, &params).await {
                        Some(PollFlow::Continue) => {}
                        Some(PollFlow::Finished) | None => return,
                    }
                }
            }
        }

        let elapsed = params.started.elapsed();
        if elapsed > params.timeout {
            inner.time_out(params.generation, &params.job_id, elapsed);
            return;
        }
    }
}
