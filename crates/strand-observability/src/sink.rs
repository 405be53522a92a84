//! Event sinks
//!
//! Every sink honours the same contract: `emit` returns promptly, never
//! blocks on a consumer and never reports failure back to the caller.

use crate::event::StrandEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Write-only, best-effort receiver of runtime events
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: StrandEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: StrandEvent) {}
}

/// Forwards events to `tracing` under the `strand::events` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: StrandEvent) {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        let kind = event.kind();

        if event.payload.is_problem() {
            warn!(
                target: "strand::events",
                kind,
                task_id = ?event.task_id,
                operation = ?event.operation,
                %payload
            );
        } else if matches!(kind, "breaker_transition" | "batch_flushed") {
            info!(target: "strand::events", kind, %payload);
        } else {
            debug!(
                target: "strand::events",
                kind,
                task_id = ?event.task_id,
                operation = ?event.operation,
                %payload
            );
        }
    }
}

/// Pushes events into a bounded channel without waiting
///
/// When the consumer falls behind, events are dropped and counted rather than
/// applying backpressure to the emitter.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<StrandEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StrandEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StrandEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Delivers each event to every inner sink
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create an empty fanout
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Check whether no sinks are attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: StrandEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::testing::EventCapture;

    fn event() -> StrandEvent {
        StrandEvent::new(EventPayload::TaskDisplaced)
    }

    #[tokio::test]
    async fn test_channel_sink_never_blocks() {
        let (sink, mut rx) = ChannelSink::new(2);

        for _ in 0..5 {
            sink.emit(event());
        }

        assert_eq!(sink.dropped(), 3);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_after_receiver_dropped() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        sink.emit(event());
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(EventCapture::new());
        let b = Arc::new(EventCapture::new());
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(Arc::new(NoopSink))
            .with(b.clone());

        fanout.emit(event());
        fanout.emit(event());

        assert_eq!(fanout.len(), 3);
        assert_eq!(a.event_count(), 2);
        assert_eq!(b.event_count(), 2);
    }

    #[test]
    fn test_tracing_sink_accepts_events() {
        TracingSink.emit(event());
        TracingSink.emit(StrandEvent::new(EventPayload::RateLimited { requeued: true }));
    }
}
