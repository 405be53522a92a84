/*!
 * Scheduler: the producer side of the task queue
 *
 * Two kinds of registration:
 *
 * - **Fixed-interval**: stamps a task every `interval`. When the queue is
 *   full the emission is skipped, never waited for.
 * - **Debounced**: [`DebounceHandle::trigger`] enqueues only when at least
 *   `window` has passed since the last enqueue of that registration. The
 *   window is leading-edge: the first eligible trigger runs with its own
 *   parameters, triggers inside the window are discarded.
 *
 * Every registration can be stopped on its own.
 */

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_observability::{EventPayload, EventSink, StrandEvent};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{report_displaced, QueueError, TaskQueue};
use super::task::{TaskId, TaskIds, TaskTemplate};
use crate::error::Result;

/// Result of a debounced trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A task was enqueued
    Enqueued(TaskId),
    /// Inside the debounce window; the trigger was discarded
    Coalesced,
    /// The queue refused the task; the window was not consumed
    QueueFull,
    /// The registration or the queue has been stopped
    Stopped,
}

/// Task producer feeding one [`TaskQueue`]
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    ids: Arc<TaskIds>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(queue: Arc<TaskQueue>, ids: Arc<TaskIds>, events: Arc<dyn EventSink>) -> Self {
        Self {
            queue,
            ids,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Start a fixed-interval registration
    ///
    /// The first task is emitted immediately. Must be called from within a
    /// tokio runtime.
    pub fn every(
        &self,
        name: impl Into<String>,
        template: TaskTemplate,
        interval: Duration,
    ) -> IntervalHandle {
        let name = name.into();
        let cancel = self.cancel.child_token();
        let counts = Arc::new(IntervalCounts::default());

        let join = tokio::spawn(run_interval(
            name.clone(),
            template,
            interval,
            self.queue.clone(),
            self.ids.clone(),
            self.events.clone(),
            cancel.clone(),
            counts.clone(),
        ));

        info!(
            schedule = %name,
            interval_ms = interval.as_millis() as u64,
            "interval schedule started"
        );

        IntervalHandle {
            name,
            cancel,
            join: Mutex::new(Some(join)),
            counts,
        }
    }

    /// Create a debounced registration
    pub fn debounced(
        &self,
        name: impl Into<String>,
        template: TaskTemplate,
        window: Duration,
    ) -> DebounceHandle {
        let name = name.into();
        debug!(
            schedule = %name,
            window_ms = window.as_millis() as u64,
            "debounced schedule registered"
        );

        DebounceHandle {
            inner: Arc::new(Debouncer {
                name,
                template,
                window,
                queue: self.queue.clone(),
                ids: self.ids.clone(),
                events: self.events.clone(),
                cancel: self.cancel.child_token(),
                last_enqueue: Mutex::new(None),
            }),
        }
    }

    /// Enqueue one task from an external caller, honouring the queue policy
    ///
    /// Under the `block` policy this waits for space.
    pub async fn submit(&self, template: &TaskTemplate, params: Option<Value>) -> Result<TaskId> {
        let task = template.instantiate(self.ids.next_id(), params);
        let id = task.id;
        if let Some(displaced) = self.queue.push(task).await? {
            report_displaced(self.events.as_ref(), displaced);
        }
        Ok(id)
    }

    /// Stop every registration created by this scheduler
    pub fn stop_all(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Default)]
struct IntervalCounts {
    emitted: AtomicU64,
    skipped: AtomicU64,
}

/// Control handle for a fixed-interval registration
#[derive(Debug)]
pub struct IntervalHandle {
    name: String,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
    counts: Arc<IntervalCounts>,
}

impl IntervalHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks put on the queue
    pub fn emitted(&self) -> u64 {
        self.counts.emitted.load(Ordering::Relaxed)
    }

    /// Emissions dropped because the queue was full
    pub fn skipped(&self) -> u64 {
        self.counts.skipped.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop emitting and wait for the timer task to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_interval(
    name: String,
    template: TaskTemplate,
    period: Duration,
    queue: Arc<TaskQueue>,
    ids: Arc<TaskIds>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    counts: Arc<IntervalCounts>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let task = template.instantiate(ids.next_id(), None);
        match queue.offer(task) {
            Ok(displaced) => {
                counts.emitted.fetch_add(1, Ordering::Relaxed);
                if let Some(displaced) = displaced {
                    report_displaced(events.as_ref(), displaced);
                }
            }
            Err(QueueError::Full(task)) => {
                counts.skipped.fetch_add(1, Ordering::Relaxed);
                warn!(schedule = %name, task_id = task.id, "queue full, emission skipped");
                events.emit(
                    StrandEvent::new(EventPayload::EmissionSkipped {
                        schedule: name.clone(),
                    })
                    .with_task(task.id, task.operation),
                );
            }
            Err(QueueError::Closed(_)) => break,
        }
    }

    info!(schedule = %name, "interval schedule stopped");
}

struct Debouncer {
    name: String,
    template: TaskTemplate,
    window: Duration,
    queue: Arc<TaskQueue>,
    ids: Arc<TaskIds>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    last_enqueue: Mutex<Option<Instant>>,
}

/// Trigger handle for a debounced registration; cheap to clone
#[derive(Clone)]
pub struct DebounceHandle {
    inner: Arc<Debouncer>,
}

impl DebounceHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Request an execution, with optional parameter override
    pub fn trigger(&self, params: Option<Value>) -> TriggerOutcome {
        let d = &self.inner;
        if d.cancel.is_cancelled() {
            return TriggerOutcome::Stopped;
        }

        let now = Instant::now();
        // Claim the window before touching the queue so concurrent triggers
        // cannot both pass
        let previous = {
            let mut last = d.last_enqueue.lock();
            let prev = *last;
            if let Some(prev) = prev {
                if now.duration_since(prev) < d.window {
                    drop(last);
                    debug!(schedule = %d.name, "trigger coalesced");
                    d.events.emit(StrandEvent::new(EventPayload::TriggerCoalesced {
                        schedule: d.name.clone(),
                    }));
                    return TriggerOutcome::Coalesced;
                }
            }
            last.replace(now)
        };

        let task = d.template.instantiate(d.ids.next_id(), params);
        let id = task.id;
        match d.queue.offer(task) {
            Ok(displaced) => {
                debug!(schedule = %d.name, task_id = id, "triggered task enqueued");
                if let Some(displaced) = displaced {
                    report_displaced(d.events.as_ref(), displaced);
                }
                TriggerOutcome::Enqueued(id)
            }
            Err(err) => {
                self.release_claim(now, previous);
                match err {
                    QueueError::Full(task) => {
                        warn!(schedule = %d.name, task_id = task.id, "queue full, trigger skipped");
                        d.events.emit(
                            StrandEvent::new(EventPayload::EmissionSkipped {
                                schedule: d.name.clone(),
                            })
                            .with_task(task.id, task.operation),
                        );
                        TriggerOutcome::QueueFull
                    }
                    QueueError::Closed(_) => TriggerOutcome::Stopped,
                }
            }
        }
    }

    /// Undo a window claim whose task never reached the queue
    fn release_claim(&self, claimed: Instant, previous: Option<Instant>) {
        let mut last = self.inner.last_enqueue.lock();
        if *last == Some(claimed) {
            *last = previous;
        }
    }

    /// Refuse further triggers
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        debug!(schedule = %self.inner.name, "debounced schedule stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for DebounceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceHandle")
            .field("name", &self.inner.name)
            .field("window", &self.inner.window)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
