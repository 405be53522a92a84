/*!
 * Strand - Resilient concurrent task-execution fabric
 *
 * Runs named operations against a shared, failure-prone backend with:
 * - Fixed-interval and debounced task producers
 * - A bounded task queue with block, drop-oldest and reject policies
 * - Token-bucket admission and a circuit breaker in front of every call
 * - Pooled backend handles
 * - Results routed to a sharded TTL cache and/or batched persistence
 * - Structured runtime events and tracing-based logging
 *
 * Version: 0.1.0
 */

pub mod cli_style;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod output;
pub mod runtime;
pub mod sim;

// Workspace crates
pub use strand_core_cache as cache;
pub use strand_core_resilience as resilience;
pub use strand_observability as observability;

// Re-export commonly used types
pub use config::{QueueFullPolicy, RateLimitedPolicy, RuntimeConfig, ScheduleConfig};
pub use core::{
    BatchSink, OperationHandler, PersistenceSink, ResultDestination, Scheduler, Task, TaskOutcome,
    TaskQueue, TaskTemplate,
};
pub use error::{ErrorCategory, Result, StrandError};
pub use output::JsonLinesSink;
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats, ShutdownReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
