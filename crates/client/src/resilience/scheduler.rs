//! Bounded FIFO scheduler for outbound work.
//!
//! Tasks are admitted in submission order while fewer than `concurrency` are
//! running, the scheduler is not paused, and the optional rate window has room.
//! Every task holds a ticket: dropping the task future before admission removes
//! it from the queue, dropping it after admission frees its slot.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ripfetch_core::{AppConfig, ClassifiedError};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

/// Admission limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once (default: 10)
    pub concurrency: usize,
    /// At most `.0` admissions per `.1` window
    pub rate: Option<(usize, Duration)>,
    /// Running-time limit per task, measured from admission
    pub timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self { concurrency: config.concurrency, rate: config.rate_window(), timeout: config.queue_timeout() }
    }
}

struct Waiting {
    id: u64,
    start: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Waiting>,
    running: usize,
    paused: bool,
    next_id: u64,
    window_start: Option<Instant>,
    window_count: usize,
    wake_scheduled: bool,
}

impl State {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.queue.is_empty()
    }
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<State>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit as many queued tasks as the limits allow.
    fn pump(self: &Arc<Self>) {
        let mut state = self.lock();
        self.pump_locked(&mut state);
    }

    fn pump_locked(self: &Arc<Self>, state: &mut State) {
        while !state.paused && state.running < self.config.concurrency && !state.queue.is_empty() {
            if let Some((cap, interval)) = self.config.rate {
                let now = Instant::now();
                let window_open = state.window_start.is_some_and(|start| now.duration_since(start) < interval);
                if !window_open {
                    state.window_start = Some(now);
                    state.window_count = 0;
                }
                if state.window_count >= cap {
                    let reopen_at = state.window_start.unwrap_or(now) + interval;
                    self.schedule_wake(state, reopen_at);
                    break;
                }
                state.window_count += 1;
            }

            let Some(next) = state.queue.pop_front() else { break };
            if next.start.send(()).is_ok() {
                state.running += 1;
            }
        }

        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn schedule_wake(self: &Arc<Self>, state: &mut State, at: Instant) {
        if state.wake_scheduled {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!("rate window exhausted outside a runtime; queued tasks wait for the next completion");
            return;
        };

        state.wake_scheduled = true;
        let weak: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(inner) = weak.upgrade() {
                inner.lock().wake_scheduled = false;
                inner.pump();
            }
        });
    }
}

/// Tracks one submitted task through queueing and running.
struct Ticket<'a> {
    inner: &'a Arc<Inner>,
    id: u64,
    start: oneshot::Receiver<()>,
    phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Done,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let holds_slot = match self.phase {
            Phase::Running => true,
            Phase::Done => false,
            // Checked under the lock so admission cannot race the removal.
            Phase::Queued => match self.start.try_recv() {
                Ok(()) => true,
                Err(oneshot::error::TryRecvError::Empty) => {
                    state.queue.retain(|w| w.id != self.id);
                    false
                }
                Err(oneshot::error::TryRecvError::Closed) => false,
            },
        };
        if holds_slot {
            state.running = state.running.saturating_sub(1);
        }
        self.inner.pump_locked(&mut state);
    }
}

/// Concurrency- and rate-bounded FIFO executor. Cheap to clone.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RequestScheduler")
            .field("config", &self.inner.config)
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let config = SchedulerConfig { concurrency: config.concurrency.max(1), ..config };
        Self { inner: Arc::new(Inner { config, state: Mutex::new(State::default()), idle: Notify::new() }) }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Queue `op` and run it once admitted.
    ///
    /// Rejects with `Cancelled` if the task is cleared before starting, and
    /// with `NetworkTimeout` if it runs longer than the configured timeout.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(Waiting { id, start: tx });
            id
        };
        let mut ticket = Ticket { inner: &self.inner, id, start: rx, phase: Phase::Queued };
        self.inner.pump();

        if (&mut ticket.start).await.is_err() {
            ticket.phase = Phase::Done;
            tracing::debug!(task = id, "queued task cleared before start");
            return Err(ClassifiedError::cancelled("task removed from queue before it started"));
        }
        ticket.phase = Phase::Running;

        match self.inner.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(task = id, timeout_ms = limit.as_millis() as u64, "scheduled task timed out");
                    Err(ClassifiedError::timeout(format!("queued task exceeded {}ms", limit.as_millis())))
                }
            },
            None => op().await,
        }
    }

    /// Stop admitting queued tasks. Running tasks continue.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        tracing::debug!("scheduler paused");
    }

    /// Resume admission after [`pause`](Self::pause).
    pub fn start(&self) {
        let mut state = self.inner.lock();
        state.paused = false;
        self.inner.pump_locked(&mut state);
        tracing::debug!("scheduler resumed");
    }

    /// Drop every queued task that has not started. They reject with `Cancelled`.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        if state.is_idle() {
            self.inner.idle.notify_waiters();
        }
        tracing::debug!(dropped, "scheduler queue cleared");
    }

    /// Resolves once nothing is running or queued.
    pub async fn on_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Tasks currently running.
    pub fn pending(&self) -> usize {
        self.inner.lock().running
    }

    /// Tasks waiting for admission.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn depth(&self) -> usize {
        let state = self.inner.lock();
        state.running + state.queue.len()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}
