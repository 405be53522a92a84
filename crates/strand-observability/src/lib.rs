//! Strand Observability: structured runtime events
//!
//! The runtime reports what happens to every task, breaker transition and
//! batch flush as a [`StrandEvent`]. Events go to an [`EventSink`], which is
//! write-only and best-effort: emitting never blocks and never fails, so a
//! slow or broken consumer cannot stall the workers.
//!
//! ## Sinks
//!
//! - [`TracingSink`]: forwards events to `tracing`
//! - [`ChannelSink`]: bounded channel, drops (and counts) events when full
//! - [`FanoutSink`]: delivers to several sinks
//! - [`NoopSink`]: discards everything
//! - [`EventCapture`]: keeps events in memory for tests
//!
//! ## Example
//!
//! ```
//! use strand_observability::{EventCapture, EventPayload, EventSink, StrandEvent};
//!
//! let capture = EventCapture::new();
//! let event = StrandEvent::new(EventPayload::RateLimited { requeued: false });
//! capture.emit(event.with_task(7, "fetch"));
//!
//! assert_eq!(capture.count_kind("rate_limited"), 1);
//! ```

pub mod event;
pub mod sink;
pub mod testing;

pub use event::{EventPayload, FlushTrigger, StrandEvent};
pub use sink::{ChannelSink, EventSink, FanoutSink, NoopSink, TracingSink};
pub use testing::EventCapture;
