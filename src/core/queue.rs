/*!
 * Bounded task queue
 *
 * The single hand-off point between producers (scheduler, external callers,
 * requeueing workers) and the executor's workers. Capacity is fixed; what
 * happens when it is full is decided by [`QueueFullPolicy`].
 */

use parking_lot::Mutex;
use std::collections::VecDeque;
use strand_observability::{EventPayload, EventSink, StrandEvent};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::task::Task;
use crate::config::QueueFullPolicy;
use crate::error::StrandError;

/// Enqueue failure; the refused task is handed back
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is full")]
    Full(Task),

    #[error("task queue is closed")]
    Closed(Task),
}

impl QueueError {
    /// Recover the refused task
    pub fn into_task(self) -> Task {
        match self {
            QueueError::Full(task) | QueueError::Closed(task) => task,
        }
    }
}

impl From<QueueError> for StrandError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full(task) => {
                StrandError::Queue(format!("queue full, task {} refused", task.id))
            }
            QueueError::Closed(_) => StrandError::Shutdown,
        }
    }
}

#[derive(Debug)]
struct Inner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer task buffer
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: QueueFullPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` pending tasks
    pub fn new(capacity: usize, policy: QueueFullPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> QueueFullPolicy {
        self.policy
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Enqueue honouring the configured policy
    ///
    /// `Block` waits for space, `DropOldest` evicts and returns the oldest
    /// pending task, `Reject` fails with [`QueueError::Full`].
    pub async fn push(&self, task: Task) -> Result<Option<Task>, QueueError> {
        if self.policy != QueueFullPolicy::Block {
            return self.offer(task);
        }

        let mut task = task;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before checking so a pop between the check and the
            // await is not missed
            notified.as_mut().enable();

            match self.try_insert(task) {
                Ok(()) => return Ok(None),
                Err(QueueError::Full(returned)) => task = returned,
                Err(closed) => return Err(closed),
            }

            notified.await;
        }
    }

    /// Enqueue without ever waiting
    ///
    /// Under `Block` and `Reject` a full queue yields [`QueueError::Full`];
    /// under `DropOldest` the oldest pending task is evicted and returned.
    pub fn offer(&self, task: Task) -> Result<Option<Task>, QueueError> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed(task));
            }

            let displaced = if inner.tasks.len() >= self.capacity {
                match self.policy {
                    QueueFullPolicy::DropOldest => inner.tasks.pop_front(),
                    QueueFullPolicy::Block | QueueFullPolicy::Reject => {
                        return Err(QueueError::Full(task));
                    }
                }
            } else {
                None
            };

            inner.tasks.push_back(task);
            displaced
        };

        self.not_empty.notify_one();
        Ok(displaced)
    }

    fn try_insert(&self, task: Task) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed(task));
            }
            if inner.tasks.len() >= self.capacity {
                return Err(QueueError::Full(task));
            }
            inner.tasks.push_back(task);
        }

        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next task, waiting while the queue is empty
    ///
    /// Returns `None` once `cancel` fires, or when the queue is closed and
    /// nothing is left to hand out.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Task> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(task) = inner.tasks.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(task);
                }
                if inner.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<Task> {
        let task = self.inner.lock().tasks.pop_front();
        if task.is_some() {
            self.not_full.notify_one();
        }
        task
    }

    /// Refuse new tasks and wake every waiter
    ///
    /// Pending tasks stay available to `pop` and `drain`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove and return every pending task
    pub fn drain(&self) -> Vec<Task> {
        let drained: Vec<Task> = self.inner.lock().tasks.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }
}

/// Report a task evicted by a drop-oldest enqueue
pub(crate) fn report_displaced(events: &dyn EventSink, displaced: Task) {
    warn!(
        task_id = displaced.id,
        operation = %displaced.operation,
        "queue full, oldest pending task displaced"
    );
    events.emit(
        StrandEvent::new(EventPayload::TaskDisplaced)
            .with_task(displaced.id, displaced.operation),
    );
}
