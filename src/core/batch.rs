/*!
 * Batch sink: accumulate results and hand them to persistence in groups
 *
 * A batch is flushed when it reaches `size` items (inline, on the adding
 * path) or when `timeout` has passed since its first item (by a background
 * timer), whichever comes first. Shutdown flushes whatever is left exactly
 * once and refuses further items.
 *
 * Persistence failures are reported, never retried: the failed batch is gone.
 */

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_observability::{EventPayload, EventSink, FlushTrigger, StrandEvent};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StrandError};

/// Destination for flushed batches
#[async_trait]
pub trait PersistenceSink<T>: Send + Sync {
    /// Persist one batch, items in the order they were added
    async fn persist(&self, batch: Vec<T>) -> Result<()>;
}

/// Batch sink statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Successful flushes
    pub flushes: u64,
    /// Items delivered by successful flushes
    pub items_flushed: u64,
    /// Flushes the persistence sink refused
    pub failed_flushes: u64,
    /// Items lost to failed flushes
    pub items_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    items_flushed: AtomicU64,
    failed_flushes: AtomicU64,
    items_failed: AtomicU64,
}

struct State<T> {
    items: Vec<T>,
    first_added: Option<Instant>,
    closed: bool,
}

struct Shared<T> {
    size: usize,
    timeout: Duration,
    state: Mutex<State<T>>,
    // FIFO; taken before the state lock is released so flushes reach the
    // sink in the order their batches were cut
    flush_order: Arc<Mutex<()>>,
    armed: Notify,
    sink: Arc<dyn PersistenceSink<T>>,
    events: Arc<dyn EventSink>,
    counters: Counters,
}

/// A batch cut from the buffer, waiting its turn at the sink
struct PendingFlush<T> {
    items: Vec<T>,
    trigger: FlushTrigger,
    _turn: OwnedMutexGuard<()>,
}

/// Size- and time-bounded accumulator in front of a [`PersistenceSink`]
pub struct BatchSink<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    cancel: CancellationToken,
    timer: SyncMutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchSink<T> {
    /// Create the sink and start its flush timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        size: usize,
        timeout: Duration,
        sink: Arc<dyn PersistenceSink<T>>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(StrandError::Config(
                "batch size must be greater than zero".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(StrandError::Config(
                "batch timeout must be greater than zero".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            size,
            timeout,
            state: Mutex::new(State {
                items: Vec::with_capacity(size),
                first_added: None,
                closed: false,
            }),
            flush_order: Arc::new(Mutex::new(())),
            armed: Notify::new(),
            sink,
            events,
            counters: Counters::default(),
        });

        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_timer(shared.clone(), cancel.clone()));

        Ok(Self {
            shared,
            cancel,
            timer: SyncMutex::new(Some(timer)),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Append an item, flushing inline when the batch is full
    ///
    /// A flush failure is returned here; the items of that batch are not
    /// kept. After shutdown every call fails with [`StrandError::Shutdown`].
    pub async fn add(&self, item: T) -> Result<()> {
        let pending = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(StrandError::Shutdown);
            }

            state.items.push(item);
            if state.items.len() == 1 {
                state.first_added = Some(Instant::now());
                self.shared.armed.notify_one();
            }

            if state.items.len() >= self.shared.size {
                Some(self.shared.cut(&mut state, FlushTrigger::Size).await)
            } else {
                None
            }
        };

        match pending {
            Some(pending) => self.shared.deliver(pending).await,
            None => Ok(()),
        }
    }

    /// Number of items waiting for the next flush
    pub async fn pending(&self) -> usize {
        self.shared.state.lock().await.items.len()
    }

    /// Flush the partial batch, refuse further items and stop the timer
    ///
    /// Only the first call flushes; later calls return `Ok(())`.
    pub async fn shutdown(&self) -> Result<()> {
        let pending = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            if state.items.is_empty() {
                None
            } else {
                Some(self.shared.cut(&mut state, FlushTrigger::Shutdown).await)
            }
        };

        self.cancel.cancel();
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        match pending {
            Some(pending) => self.shared.deliver(pending).await,
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> BatchStats {
        let c = &self.shared.counters;
        BatchStats {
            flushes: c.flushes.load(Ordering::Relaxed),
            items_flushed: c.items_flushed.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            items_failed: c.items_failed.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> Drop for BatchSink<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: Send + 'static> std::fmt::Debug for BatchSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSink")
            .field("size", &self.shared.size)
            .field("timeout", &self.shared.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Take the buffered items and queue up behind earlier flushes
    async fn cut(&self, state: &mut State<T>, trigger: FlushTrigger) -> PendingFlush<T> {
        let items = std::mem::replace(&mut state.items, Vec::with_capacity(self.size));
        state.first_added = None;
        let turn = self.flush_order.clone().lock_owned().await;
        PendingFlush {
            items,
            trigger,
            _turn: turn,
        }
    }

    /// Hand a cut batch to the persistence sink
    async fn deliver(&self, pending: PendingFlush<T>) -> Result<()> {
        let PendingFlush {
            items,
            trigger,
            _turn,
        } = pending;
        let count = items.len();

        match self.sink.persist(items).await {
            Ok(()) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .items_flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(items = count, %trigger, "batch flushed");
                self.events.emit(StrandEvent::new(EventPayload::BatchFlushed {
                    items: count,
                    trigger,
                }));
                Ok(())
            }
            Err(e) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .items_failed
                    .fetch_add(count as u64, Ordering::Relaxed);
                warn!(items = count, %trigger, error = %e, "batch flush failed");
                self.events
                    .emit(StrandEvent::new(EventPayload::BatchFlushFailed {
                        items: count,
                        trigger,
                        error: e.to_string(),
                    }));
                Err(match e {
                    StrandError::Sink(msg) => StrandError::Sink(msg),
                    other => StrandError::Sink(other.to_string()),
                })
            }
        }
    }

    /// Flush if the oldest buffered item has waited `timeout`
    async fn flush_if_due(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            let due = state
                .first_added
                .is_some_and(|first| Instant::now() >= first + self.timeout);
            if !due || state.items.is_empty() {
                return;
            }
            self.cut(&mut state, FlushTrigger::Timeout).await
        };

        // Failures already went to the log and the event sink
        let _ = self.deliver(pending).await;
    }
}

async fn run_timer<T: Send + 'static>(shared: Arc<Shared<T>>, cancel: CancellationToken) {
    loop {
        let deadline = {
            let state = shared.state.lock().await;
            state.first_added.map(|first| first + shared.timeout)
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => shared.flush_if_due().await,
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.armed.notified() => {}
                }
            }
        }
    }

    debug!("batch timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_observability::EventCapture;

    #[derive(Default)]
    struct RecordingSink {
        batches: SyncMutex<Vec<Vec<u32>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl PersistenceSink<u32> for RecordingSink {
        async fn persist(&self, batch: Vec<u32>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StrandError::Sink("store unavailable".to_string()));
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn batch_sink(
        size: usize,
        timeout: Duration,
    ) -> (BatchSink<u32>, Arc<RecordingSink>, Arc<EventCapture>) {
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventCapture::new());
        let batch = BatchSink::new(size, timeout, sink.clone(), events.clone()).unwrap();
        (batch, sink, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_triggered_flush_keeps_order() {
        let (batch, sink, events) = batch_sink(3, Duration::from_secs(10));

        batch.add(1).await.unwrap();
        batch.add(2).await.unwrap();
        assert!(sink.batches().is_empty());

        batch.add(3).await.unwrap();
        assert_eq!(sink.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(batch.pending().await, 0);
        assert_eq!(events.count_kind("batch_flushed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flushes_partial_batch_once() {
        let (batch, sink, _events) = batch_sink(10, Duration::from_millis(500));

        batch.add(1).await.unwrap();
        batch.add(2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(sink.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.batches(), vec![vec![1, 2]]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_after_each_flush() {
        let (batch, sink, _events) = batch_sink(2, Duration::from_millis(500));

        batch.add(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        batch.add(2).await.unwrap(); // size flush
        batch.add(3).await.unwrap();

        // The old deadline (t=500ms) must not flush item 3
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.batches(), vec![vec![1, 2]]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.batches(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remainder_exactly_once() {
        let (batch, sink, events) = batch_sink(10, Duration::from_secs(60));

        batch.add(1).await.unwrap();
        batch.add(2).await.unwrap();

        batch.shutdown().await.unwrap();
        batch.shutdown().await.unwrap();

        assert_eq!(sink.batches(), vec![vec![1, 2]]);
        assert!(matches!(batch.add(3).await, Err(StrandError::Shutdown)));

        let flushed = events.of_kind("batch_flushed");
        assert_eq!(flushed.len(), 1);
        assert_eq!(
            flushed[0].payload,
            EventPayload::BatchFlushed {
                items: 2,
                trigger: FlushTrigger::Shutdown
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_empty_batch_does_not_flush() {
        let (batch, sink, _events) = batch_sink(10, Duration::from_secs(1));
        batch.shutdown().await.unwrap();
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_surfaces_to_adder_without_retry() {
        let (batch, sink, events) = batch_sink(2, Duration::from_secs(10));
        sink.fail.store(true, Ordering::SeqCst);

        batch.add(1).await.unwrap();
        let err = batch.add(2).await.unwrap_err();
        assert!(matches!(err, StrandError::Sink(_)));

        sink.fail.store(false, Ordering::SeqCst);
        batch.add(3).await.unwrap();
        batch.add(4).await.unwrap();

        // The failed batch is not replayed
        assert_eq!(sink.batches(), vec![vec![3, 4]]);
        assert_eq!(events.count_kind("batch_flush_failed"), 1);

        let stats = batch.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.items_failed, 2);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.items_flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_failure_is_reported_as_event() {
        let (batch, sink, events) = batch_sink(10, Duration::from_millis(100));
        sink.fail.store(true, Ordering::SeqCst);

        batch.add(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let failed = events.of_kind("batch_flush_failed");
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0].payload,
            EventPayload::BatchFlushFailed {
                items: 1,
                trigger: FlushTrigger::Timeout,
                ..
            }
        ));
        assert_eq!(batch.pending().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adders_deliver_each_item_once() {
        let (batch, sink, _events) = batch_sink(7, Duration::from_millis(20));
        let batch = Arc::new(batch);

        let mut handles = Vec::new();
        for worker in 0..4u32 {
            let batch = batch.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    batch.add(worker * 100 + i).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        batch.shutdown().await.unwrap();

        let batches = sink.batches();
        assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 7));

        let mut all: Vec<u32> = batches.into_iter().flatten().collect();
        assert_eq!(all.len(), 100);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 100);
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventCapture::new());
        assert!(
            BatchSink::<u32>::new(0, Duration::from_secs(1), sink.clone(), events.clone()).is_err()
        );
        assert!(BatchSink::<u32>::new(1, Duration::ZERO, sink, events).is_err());
    }
}
