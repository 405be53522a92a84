/*!
 * Executor pool: a fixed set of workers draining the task queue
 *
 * Each worker takes one task at a time and:
 *
 * 1. asks the token gate for admission (denied tasks are dropped or
 *    requeued per [`RateLimitedPolicy`]),
 * 2. runs the operation handler through the circuit breaker, leasing a
 *    resource from the pool for exactly the duration of the call and
 *    bounding the call by the configured deadline,
 * 3. routes a successful result to the cache and/or the batch sink.
 *
 * Failures are reported and never retried here. No failure stops a worker.
 */

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_core_cache::ShardStore;
use strand_core_resilience::{
    CircuitBreaker, CircuitState, ResilienceError, ResourcePool, TokenGate, TransitionListener,
};
use strand_observability::{EventPayload, EventSink, StrandEvent};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batch::BatchSink;
use super::queue::{report_displaced, TaskQueue};
use super::task::{Task, TaskOutcome};
use crate::config::RateLimitedPolicy;
use crate::error::ErrorCategory;

/// The protected call behind an operation name
#[async_trait]
pub trait OperationHandler<R: Send>: Send + Sync {
    /// Run the operation against a leased resource
    ///
    /// `deadline` is when the executor gives up on the call; handlers may use
    /// it to bound their own I/O.
    async fn call(
        &self,
        resource: &mut R,
        params: &Value,
        deadline: Instant,
    ) -> Result<Value, ResilienceError>;
}

/// Operation name to handler lookup
pub struct HandlerRegistry<R: Send> {
    handlers: HashMap<String, Arc<dyn OperationHandler<R>>>,
}

impl<R: Send> HandlerRegistry<R> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for `operation`
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: Arc<dyn OperationHandler<R>>,
    ) {
        self.handlers.insert(operation.into(), handler);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(
        mut self,
        operation: impl Into<String>,
        handler: Arc<dyn OperationHandler<R>>,
    ) -> Self {
        self.register(operation, handler);
        self
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler<R>>> {
        self.handlers.get(operation).cloned()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<R: Send> Default for HandlerRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send> std::fmt::Debug for HandlerRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workers: usize,
    pub call_timeout: Duration,
    pub rate_limited_policy: RateLimitedPolicy,
}

/// Shared components the workers operate on
pub struct ExecutorContext<R: Send + 'static> {
    pub queue: Arc<TaskQueue>,
    pub gate: Arc<TokenGate>,
    pub breaker: CircuitBreaker,
    pub pool: Arc<ResourcePool<R>>,
    pub cache: Arc<ShardStore<String, Value>>,
    pub batch: Arc<BatchSink<TaskOutcome>>,
    pub handlers: Arc<HandlerRegistry<R>>,
    pub events: Arc<dyn EventSink>,
    pub settings: ExecutorSettings,
}

/// Executor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Calls that succeeded and had their result routed
    pub completed: u64,
    /// Calls that failed (including resource acquisition and deadline)
    pub failed: u64,
    /// Tasks the breaker refused without calling
    pub rejected_by_breaker: u64,
    /// Tasks the token gate denied
    pub rate_limited: u64,
    /// Denied tasks put back on the queue
    pub requeued: u64,
    /// Tasks naming an operation with no handler
    pub unknown_operation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected_by_breaker: AtomicU64,
    rate_limited: AtomicU64,
    requeued: AtomicU64,
    unknown_operation: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected_by_breaker: self.rejected_by_breaker.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            unknown_operation: self.unknown_operation.load(Ordering::Relaxed),
        }
    }
}

/// Running worker pool
pub struct ExecutorPool {
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    worker_count: usize,
}

impl ExecutorPool {
    /// Spawn `settings.workers` workers over `ctx`
    pub fn start<R: Send + 'static>(ctx: ExecutorContext<R>) -> Self {
        let worker_count = ctx.settings.workers;
        let ctx = Arc::new(ctx);
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let workers = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    ctx: ctx.clone(),
                    counters: counters.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = worker_count, "executor pool started");

        Self {
            cancel,
            workers: Mutex::new(workers),
            counters,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Signal every worker to finish its current task and exit, then wait
    ///
    /// Tasks still in the queue are left there.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "executor worker panicked");
            }
        }
        info!("executor pool stopped");
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("workers", &self.worker_count)
            .field("stats", &self.stats())
            .finish()
    }
}

struct Worker<R: Send + 'static> {
    id: usize,
    ctx: Arc<ExecutorContext<R>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<R: Send + 'static> Worker<R> {
    async fn run(self) {
        debug!(worker = self.id, "worker started");

        loop {
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = self.ctx.queue.pop(&self.cancel) => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            self.process(task).await;
        }

        debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, task: Task) {
        if !self.ctx.gate.allow() {
            self.on_rate_limited(task).await;
            return;
        }

        let Some(handler) = self.ctx.handlers.get(&task.operation) else {
            Counters::bump(&self.counters.unknown_operation);
            Counters::bump(&self.counters.failed);
            warn!(
                task_id = task.id,
                operation = %task.operation,
                "no handler registered for operation"
            );
            self.emit(
                &task,
                EventPayload::TaskFailed {
                    error: format!("unknown operation '{}'", task.operation),
                    category: ErrorCategory::Configuration.to_string(),
                },
            );
            return;
        };

        let timeout = self.ctx.settings.call_timeout;
        let deadline = Instant::now() + timeout;
        let started = Instant::now();

        let pool = &self.ctx.pool;
        let params = &task.params;
        let result = self
            .ctx
            .breaker
            .execute(|| async move {
                let mut lease = pool.lease().await?;
                match tokio::time::timeout_at(deadline, handler.call(&mut *lease, params, deadline))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::DeadlineExceeded(timeout)),
                }
            })
            .await;

        match result {
            Ok(value) => self.on_success(&task, value, started.elapsed()).await,
            Err(e) if e.is_rejection() => {
                Counters::bump(&self.counters.rejected_by_breaker);
                debug!(
                    task_id = task.id,
                    operation = %task.operation,
                    reason = %e,
                    "task rejected"
                );
                self.emit(&task, EventPayload::TaskRejected { reason: e.to_string() });
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                let category = ErrorCategory::from(&e);
                warn!(
                    task_id = task.id,
                    operation = %task.operation,
                    error = %e,
                    %category,
                    "task failed"
                );
                self.emit(
                    &task,
                    EventPayload::TaskFailed {
                        error: e.to_string(),
                        category: category.to_string(),
                    },
                );
            }
        }
    }

    async fn on_success(&self, task: &Task, value: Value, elapsed: Duration) {
        let mut cached = false;
        if let Some(target) = &task.destination.cache {
            self.ctx
                .cache
                .set(target.key.clone(), value.clone(), target.ttl);
            cached = true;
        }

        let mut persisted = false;
        if task.destination.persist {
            let outcome = TaskOutcome {
                task_id: task.id,
                operation: task.operation.clone(),
                result: value,
                completed_at: Utc::now(),
            };
            match self.ctx.batch.add(outcome).await {
                Ok(()) => persisted = true,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "result not persisted");
                }
            }
        }

        Counters::bump(&self.counters.completed);
        debug!(
            task_id = task.id,
            operation = %task.operation,
            elapsed_ms = elapsed.as_millis() as u64,
            cached,
            persisted,
            "task completed"
        );
        self.emit(
            task,
            EventPayload::TaskCompleted {
                duration_ms: elapsed.as_millis() as u64,
                cached,
                persisted,
            },
        );
    }

    async fn on_rate_limited(&self, task: Task) {
        Counters::bump(&self.counters.rate_limited);

        if self.ctx.settings.rate_limited_policy == RateLimitedPolicy::Drop {
            debug!(task_id = task.id, operation = %task.operation, "rate limited, task dropped");
            self.emit(&task, EventPayload::RateLimited { requeued: false });
            return;
        }

        // A gate that never refills will never admit this task
        let Some(wait) = self.ctx.gate.time_until_available() else {
            self.emit(&task, EventPayload::RateLimited { requeued: false });
            return;
        };

        // On stop the task goes straight back so shutdown can account for it
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }

        let id = task.id;
        let operation = task.operation.clone();
        match self.ctx.queue.offer(task) {
            Ok(displaced) => {
                Counters::bump(&self.counters.requeued);
                debug!(task_id = id, operation = %operation, "rate limited, task requeued");
                self.ctx.events.emit(
                    StrandEvent::new(EventPayload::RateLimited { requeued: true })
                        .with_task(id, operation),
                );
                if let Some(displaced) = displaced {
                    report_displaced(self.ctx.events.as_ref(), displaced);
                }
            }
            Err(e) => {
                warn!(
                    task_id = id,
                    operation = %operation,
                    error = %e,
                    "rate limited, requeue refused"
                );
                self.ctx.events.emit(
                    StrandEvent::new(EventPayload::RateLimited { requeued: false })
                        .with_task(id, operation),
                );
            }
        }
    }

    fn emit(&self, task: &Task, payload: EventPayload) {
        self.ctx
            .events
            .emit(StrandEvent::new(payload).with_task(task.id, task.operation.clone()));
    }
}

/// Reports breaker transitions to the log and the event sink
pub struct BreakerEvents {
    events: Arc<dyn EventSink>,
}

impl BreakerEvents {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }
}

impl TransitionListener for BreakerEvents {
    fn on_transition(&self, from: CircuitState, to: CircuitState) {
        info!(from = from.name(), to = to.name(), "circuit breaker transition");
        self.events.emit(StrandEvent::new(EventPayload::BreakerTransition {
            from: from.name().to_string(),
            to: to.name().to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueFullPolicy;
    use crate::core::batch::PersistenceSink;
    use crate::core::task::ResultDestination;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use strand_core_resilience::{CircuitBreakerConfig, ResourceFactory};
    use strand_observability::EventCapture;

    struct Conn;

    struct ConnFactory {
        created: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ResourceFactory<Conn> for ConnFactory {
        async fn create(&self) -> Result<Conn, ResilienceError> {
            if self.fail {
                return Err(ResilienceError::ResourceAcquisition("refused".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn)
        }
    }

    struct Echo;

    #[async_trait]
    impl OperationHandler<Conn> for Echo {
        async fn call(
            &self,
            _: &mut Conn,
            params: &Value,
            _: Instant,
        ) -> Result<Value, ResilienceError> {
            Ok(json!({ "echo": params }))
        }
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperationHandler<Conn> for Failing {
        async fn call(
            &self,
            _: &mut Conn,
            _: &Value,
            _: Instant,
        ) -> Result<Value, ResilienceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::Transient("backend error".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl OperationHandler<Conn> for Slow {
        async fn call(
            &self,
            _: &mut Conn,
            _: &Value,
            _: Instant,
        ) -> Result<Value, ResilienceError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct Collect {
        items: Mutex<Vec<TaskOutcome>>,
    }

    #[async_trait]
    impl PersistenceSink<TaskOutcome> for Collect {
        async fn persist(&self, batch: Vec<TaskOutcome>) -> crate::error::Result<()> {
            self.items.lock().extend(batch);
            Ok(())
        }
    }

    struct Harness {
        queue: Arc<TaskQueue>,
        cache: Arc<ShardStore<String, Value>>,
        batch: Arc<BatchSink<TaskOutcome>>,
        persisted: Arc<Collect>,
        pool: Arc<ResourcePool<Conn>>,
        breaker: CircuitBreaker,
        events: Arc<EventCapture>,
        failing: Arc<Failing>,
        executor: ExecutorPool,
    }

    fn harness(
        rate: (u64, f64),
        policy: RateLimitedPolicy,
        factory_fails: bool,
        call_timeout: Duration,
    ) -> Harness {
        let queue = Arc::new(TaskQueue::new(16, QueueFullPolicy::Reject));
        let cache = Arc::new(ShardStore::new(4).unwrap());
        let events = Arc::new(EventCapture::new());
        let persisted = Arc::new(Collect::default());
        let batch = Arc::new(
            BatchSink::new(1, Duration::from_secs(1), persisted.clone(), events.clone()).unwrap(),
        );
        let pool = Arc::new(ResourcePool::new(
            Arc::new(ConnFactory {
                created: AtomicUsize::new(0),
                fail: factory_fails,
            }),
            2,
        ));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 3,
            cooldown: Duration::from_secs(1),
        })
        .with_listener(Arc::new(BreakerEvents::new(events.clone())));
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });

        let handlers = HandlerRegistry::new()
            .with("echo", Arc::new(Echo))
            .with("fail", failing.clone())
            .with("slow", Arc::new(Slow));

        let executor = ExecutorPool::start(ExecutorContext {
            queue: queue.clone(),
            gate: Arc::new(TokenGate::new(rate.0, rate.1).unwrap()),
            breaker: breaker.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            batch: batch.clone(),
            handlers: Arc::new(handlers),
            events: events.clone(),
            settings: ExecutorSettings {
                workers: 2,
                call_timeout,
                rate_limited_policy: policy,
            },
        });

        Harness {
            queue,
            cache,
            batch,
            persisted,
            pool,
            breaker,
            events,
            failing,
            executor,
        }
    }

    fn default_harness() -> Harness {
        harness((100, 100.0), RateLimitedPolicy::Drop, false, Duration::from_secs(5))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_routes_to_cache_and_batch() {
        let h = default_harness();
        let destination =
            ResultDestination::cache("greeting", Duration::from_secs(60)).with_persist(true);
        h.queue
            .offer(Task::new(1, "echo", json!("hi"), destination))
            .unwrap();

        settle().await;

        assert_eq!(h.cache.get("greeting"), Some(json!({ "echo": "hi" })));
        let persisted = h.persisted.items.lock().clone();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].task_id, 1);
        assert_eq!(h.executor.stats().completed, 1);
        assert_eq!(h.events.count_kind("task_completed"), 1);

        // The lease went back to the pool
        assert_eq!(h.pool.stats().idle, 1);
        h.executor.stop().await;
        h.batch.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_breaker_then_reject() {
        let h = default_harness();
        for id in 1..=5 {
            h.queue
                .offer(Task::new(id, "fail", Value::Null, ResultDestination::none()))
                .unwrap();
            settle().await;
        }

        assert_eq!(h.failing.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(h.breaker.state(), CircuitState::Open { .. }));

        let stats = h.executor.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.rejected_by_breaker, 2);
        assert_eq!(h.events.count_kind("task_rejected"), 2);
        assert_eq!(h.events.count_kind("breaker_transition"), 1);
        // The resource is released on failure too
        assert_eq!(h.pool.stats().borrowed, 0);
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_acquisition_failure_counts_toward_breaker() {
        let h = harness((100, 100.0), RateLimitedPolicy::Drop, true, Duration::from_secs(5));
        for id in 1..=3 {
            h.queue
                .offer(Task::new(id, "echo", Value::Null, ResultDestination::none()))
                .unwrap();
            settle().await;
        }

        assert_eq!(h.breaker.failure_count(), 3);
        let failed = h.events.of_kind("task_failed");
        assert!(matches!(
            &failed[0].payload,
            EventPayload::TaskFailed { category, .. } if category == "resource_acquisition"
        ));
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_is_a_failure() {
        let h = harness((100, 100.0), RateLimitedPolicy::Drop, false, Duration::from_millis(200));
        h.queue
            .offer(Task::new(1, "slow", Value::Null, ResultDestination::none()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.executor.stats().failed, 1);
        assert_eq!(h.breaker.failure_count(), 1);
        let failed = h.events.of_kind("task_failed");
        assert!(matches!(
            &failed[0].payload,
            EventPayload::TaskFailed { category, .. } if category == "transient"
        ));
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_does_not_touch_breaker() {
        let h = default_harness();
        h.queue
            .offer(Task::new(1, "missing", Value::Null, ResultDestination::none()))
            .unwrap();
        settle().await;

        let stats = h.executor.stats();
        assert_eq!(stats.unknown_operation, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.breaker.failure_count(), 0);
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_tasks_dropped() {
        let h = harness((2, 0.0), RateLimitedPolicy::Drop, false, Duration::from_secs(5));
        for id in 1..=5 {
            h.queue
                .offer(Task::new(id, "echo", Value::Null, ResultDestination::none()))
                .unwrap();
        }
        settle().await;

        let stats = h.executor.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.rate_limited, 3);
        assert_eq!(stats.requeued, 0);
        assert_eq!(h.events.count_kind("rate_limited"), 3);
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_tasks_requeued_until_admitted() {
        let h = harness((1, 10.0), RateLimitedPolicy::Requeue, false, Duration::from_secs(5));
        for id in 1..=3 {
            h.queue
                .offer(Task::new(id, "echo", Value::Null, ResultDestination::none()))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = h.executor.stats();
        assert_eq!(stats.completed, 3);
        assert!(stats.requeued >= 2);
        assert!(h.queue.is_empty());
        h.executor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_pending_tasks_in_queue() {
        let h = default_harness();
        h.executor.stop().await;

        h.queue
            .offer(Task::new(1, "echo", Value::Null, ResultDestination::none()))
            .unwrap();
        settle().await;

        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.executor.stats().completed, 0);
    }

    #[test]
    fn test_registry_lookup() {
        let registry: HandlerRegistry<Conn> = HandlerRegistry::new().with("echo", Arc::new(Echo));
        assert!(registry.contains("echo"));
        assert!(registry.get("other").is_none());
        assert_eq!(registry.operations(), vec!["echo"]);
    }
}
