//! Testing utilities
//!
//! [`EventCapture`] is an [`EventSink`] that keeps every event in memory so
//! tests can assert on what the runtime reported.

use crate::event::StrandEvent;
use crate::sink::EventSink;
use parking_lot::Mutex;

/// Event capture utility for testing
///
/// ## Example
///
/// ```
/// use strand_observability::{EventCapture, EventPayload, EventSink, StrandEvent};
///
/// let capture = EventCapture::new();
/// capture.emit(StrandEvent::new(EventPayload::TaskDisplaced));
///
/// assert_eq!(capture.event_count(), 1);
/// assert_eq!(capture.events()[0].payload.to_string(), "task_displaced");
/// ```
#[derive(Debug, Default)]
pub struct EventCapture {
    events: Mutex<Vec<StrandEvent>>,
}

impl EventCapture {
    /// Create a new, empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured events
    pub fn events(&self) -> Vec<StrandEvent> {
        self.events.lock().clone()
    }

    /// Get the number of captured events
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Count events of one kind (`"task_failed"`, `"batch_flushed"`, ...)
    pub fn count_kind(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    /// Captured events of one kind, in emission order
    pub fn of_kind(&self, kind: &str) -> Vec<StrandEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect()
    }

    /// Clear all captured events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for EventCapture {
    fn emit(&self, event: StrandEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;

    #[test]
    fn test_capture_and_filter() {
        let capture = EventCapture::new();
        capture.emit(StrandEvent::new(EventPayload::TaskDisplaced));
        capture.emit(
            StrandEvent::new(EventPayload::RateLimited { requeued: false }).with_task(1, "op"),
        );
        capture.emit(StrandEvent::new(EventPayload::TaskDisplaced));

        assert_eq!(capture.event_count(), 3);
        assert_eq!(capture.count_kind("task_displaced"), 2);
        assert_eq!(capture.of_kind("rate_limited")[0].task_id, Some(1));

        capture.clear();
        assert_eq!(capture.event_count(), 0);
    }
}
