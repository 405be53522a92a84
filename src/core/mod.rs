/*!
 * Core task-execution components
 *
 * - [`task`]: task descriptors and outcomes
 * - [`queue`]: bounded task queue with backpressure policies
 * - [`batch`]: size/time-bounded batching in front of persistence
 * - [`executor`]: worker pool running tasks through gate, breaker and pool
 * - [`scheduler`]: fixed-interval and debounced task producers
 */

pub mod batch;
pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use batch::{BatchSink, BatchStats, PersistenceSink};
pub use executor::{
    BreakerEvents, ExecutorContext, ExecutorPool, ExecutorSettings, ExecutorStats,
    HandlerRegistry, OperationHandler,
};
pub use queue::{QueueError, TaskQueue};
pub use scheduler::{DebounceHandle, IntervalHandle, Scheduler, TriggerOutcome};
pub use task::{CacheTarget, ResultDestination, Task, TaskId, TaskIds, TaskOutcome, TaskTemplate};
