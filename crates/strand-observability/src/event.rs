//! Unified event schema for Strand observability

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One structured runtime event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandEvent {
    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,

    /// Task the event is about, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,

    /// Operation the task runs, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Event-specific payload
    pub payload: EventPayload,
}

impl StrandEvent {
    /// Create a new event stamped with the current time
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: None,
            operation: None,
            payload,
        }
    }

    /// Attach task correlation
    pub fn with_task(mut self, task_id: u64, operation: impl Into<String>) -> Self {
        self.task_id = Some(task_id);
        self.operation = Some(operation.into());
        self
    }

    /// Short snake_case name of the payload variant
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// What caused a batch flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// The batch reached its size threshold
    Size,
    /// The oldest item waited for the full timeout
    Timeout,
    /// The sink was shutting down
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Timeout => write!(f, "timeout"),
            FlushTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Event payload variants
///
/// Serialized with a `"type"` tag for clean JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The protected call succeeded and its result was routed
    TaskCompleted {
        duration_ms: u64,
        cached: bool,
        persisted: bool,
    },

    /// The protected call (or resource acquisition) failed
    TaskFailed { error: String, category: String },

    /// The task was refused before the call was attempted
    TaskRejected { reason: String },

    /// The token gate denied the task
    RateLimited { requeued: bool },

    /// A pending task was evicted by a drop-oldest queue
    TaskDisplaced,

    /// A fixed-interval emission was skipped because the queue was full
    EmissionSkipped { schedule: String },

    /// A debounced trigger was absorbed inside its window
    TriggerCoalesced { schedule: String },

    /// Circuit breaker changed state
    BreakerTransition { from: String, to: String },

    /// A batch was handed to the persistence sink
    BatchFlushed { items: usize, trigger: FlushTrigger },

    /// The persistence sink refused a batch
    BatchFlushFailed {
        items: usize,
        trigger: FlushTrigger,
        error: String,
    },
}

impl EventPayload {
    /// Short snake_case name, matching the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TaskCompleted { .. } => "task_completed",
            EventPayload::TaskFailed { .. } => "task_failed",
            EventPayload::TaskRejected { .. } => "task_rejected",
            EventPayload::RateLimited { .. } => "rate_limited",
            EventPayload::TaskDisplaced => "task_displaced",
            EventPayload::EmissionSkipped { .. } => "emission_skipped",
            EventPayload::TriggerCoalesced { .. } => "trigger_coalesced",
            EventPayload::BreakerTransition { .. } => "breaker_transition",
            EventPayload::BatchFlushed { .. } => "batch_flushed",
            EventPayload::BatchFlushFailed { .. } => "batch_flush_failed",
        }
    }

    /// Whether the event reports something going wrong
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            EventPayload::TaskFailed { .. }
                | EventPayload::BatchFlushFailed { .. }
                | EventPayload::TaskDisplaced
                | EventPayload::EmissionSkipped { .. }
        )
    }
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
