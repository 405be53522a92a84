/*!
 * Runtime builder: wires every component from one [`RuntimeConfig`]
 *
 * Each shared component is an owned value created here and handed to the
 * pieces that need it. Nothing is global.
 */

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strand_core_cache::{spawn_sweeper, CacheStats, ShardStore};
use strand_core_resilience::{
    CircuitBreaker, CircuitBreakerConfig, PoolStats, ResourceFactory, ResourcePool, TokenGate,
};
use strand_observability::{EventSink, TracingSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{RuntimeConfig, ScheduleConfig, ScheduleKind};
use crate::core::{
    BatchSink, BatchStats, BreakerEvents, DebounceHandle, ExecutorContext, ExecutorPool,
    ExecutorSettings, ExecutorStats, HandlerRegistry, IntervalHandle, OperationHandler,
    PersistenceSink, ResultDestination, Scheduler, TaskId, TaskIds, TaskOutcome, TaskQueue,
    TaskTemplate,
};
use crate::error::{Result, StrandError};

/// Collects collaborators, then starts a [`Runtime`]
pub struct RuntimeBuilder<R: Send + 'static> {
    config: RuntimeConfig,
    factory: Option<Arc<dyn ResourceFactory<R>>>,
    persistence: Option<Arc<dyn PersistenceSink<TaskOutcome>>>,
    handlers: HandlerRegistry<R>,
    events: Arc<dyn EventSink>,
}

impl<R: Send + 'static> RuntimeBuilder<R> {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            factory: None,
            persistence: None,
            handlers: HandlerRegistry::new(),
            events: Arc::new(TracingSink),
        }
    }

    /// Resource factory backing the pool
    pub fn factory(mut self, factory: Arc<dyn ResourceFactory<R>>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Destination of flushed result batches
    pub fn persistence(mut self, sink: Arc<dyn PersistenceSink<TaskOutcome>>) -> Self {
        self.persistence = Some(sink);
        self
    }

    /// Register the handler for an operation name
    pub fn handler(
        mut self,
        operation: impl Into<String>,
        handler: Arc<dyn OperationHandler<R>>,
    ) -> Self {
        self.handlers.register(operation, handler);
        self
    }

    /// Observability collaborator (defaults to [`TracingSink`])
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Validate everything and start the workers, sweeper, batch timer and
    /// schedules
    ///
    /// Must be called from within a tokio runtime. Any error here is a
    /// configuration error: nothing is left running.
    pub fn start(self) -> Result<Runtime<R>> {
        let RuntimeBuilder {
            config,
            factory,
            persistence,
            handlers,
            events,
        } = self;

        config.validate()?;

        let factory = factory
            .ok_or_else(|| StrandError::Config("no resource factory configured".to_string()))?;
        let persistence = persistence
            .ok_or_else(|| StrandError::Config("no persistence sink configured".to_string()))?;

        for schedule in &config.schedules {
            if !handlers.contains(&schedule.operation) {
                return Err(StrandError::Config(format!(
                    "schedule '{}' references unknown operation '{}'",
                    schedule.name, schedule.operation
                )));
            }
        }

        let gate = Arc::new(
            TokenGate::new(config.rate_limit.capacity, config.rate_limit.refill_rate)
                .map_err(|e| StrandError::Config(e.to_string()))?,
        );
        let cache = Arc::new(
            ShardStore::new(config.cache.shard_count)
                .map_err(|e| StrandError::Config(e.to_string()))?,
        );
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: config.breaker.max_failures,
            cooldown: config.breaker.cooldown(),
        })
        .with_listener(Arc::new(BreakerEvents::new(events.clone())));
        let queue = Arc::new(TaskQueue::new(config.queue.capacity, config.queue.policy));
        let pool = Arc::new(ResourcePool::new(factory, config.pool.capacity));

        // Everything below spawns tasks
        let batch = Arc::new(BatchSink::new(
            config.batch.size,
            config.batch.timeout(),
            persistence,
            events.clone(),
        )?);

        let cancel = CancellationToken::new();
        let sweeper = spawn_sweeper(
            cache.clone(),
            config.cache.sweep_interval(),
            cancel.child_token(),
        );

        let executor = ExecutorPool::start(ExecutorContext {
            queue: queue.clone(),
            gate: gate.clone(),
            breaker: breaker.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            batch: batch.clone(),
            handlers: Arc::new(handlers),
            events: events.clone(),
            settings: ExecutorSettings {
                workers: config.executor.workers,
                call_timeout: config.executor.call_timeout(),
                rate_limited_policy: config.executor.rate_limited_policy,
            },
        });

        let scheduler = Scheduler::new(queue.clone(), Arc::new(TaskIds::new()), events.clone());
        let mut intervals = Vec::new();
        let mut debouncers = HashMap::new();
        for schedule in &config.schedules {
            let template = template_for(schedule, &config);
            match schedule.kind()? {
                ScheduleKind::Interval(period) => {
                    intervals.push(scheduler.every(schedule.name.clone(), template, period));
                }
                ScheduleKind::Debounced(window) => {
                    debouncers.insert(
                        schedule.name.clone(),
                        scheduler.debounced(schedule.name.clone(), template, window),
                    );
                }
            }
        }

        info!(
            workers = config.executor.workers,
            queue_capacity = config.queue.capacity,
            schedules = config.schedules.len(),
            "runtime started"
        );

        Ok(Runtime {
            config,
            queue,
            gate,
            breaker,
            pool,
            cache,
            batch,
            scheduler,
            executor,
            intervals,
            debouncers,
            sweeper: Some(sweeper),
            cancel,
        })
    }
}

/// Task template for a configured schedule
pub fn template_for(schedule: &ScheduleConfig, config: &RuntimeConfig) -> TaskTemplate {
    let mut destination = ResultDestination::none().with_persist(schedule.persist);
    if let Some(key) = &schedule.cache_key {
        let ttl = schedule
            .cache_ttl_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| config.cache.default_ttl());
        destination = destination.with_cache(key.clone(), ttl);
    }

    TaskTemplate::new(schedule.operation.clone())
        .with_params(schedule.params.clone())
        .with_destination(destination)
}

/// Point-in-time view of every component
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub executor: ExecutorStats,
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub batch: BatchStats,
    pub queue_depth: usize,
    pub breaker_state: &'static str,
}

impl RuntimeStats {
    /// One-line human readable summary
    pub fn summary(&self) -> String {
        format!(
            "completed={} failed={} rejected={} rate_limited={} requeued={} | queue={} breaker={} \
             | cache hits={} misses={} entries={} | pool idle={} created={} \
             | batches={} items={} failed_batches={}",
            self.executor.completed,
            self.executor.failed,
            self.executor.rejected_by_breaker,
            self.executor.rate_limited,
            self.executor.requeued,
            self.queue_depth,
            self.breaker_state,
            self.cache.hits,
            self.cache.misses,
            self.cache.entries,
            self.pool.idle,
            self.pool.created,
            self.batch.flushes,
            self.batch.items_flushed,
            self.batch.failed_flushes,
        )
    }
}

/// What shutdown left behind
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Pending tasks that were never run
    pub discarded_tasks: usize,
    /// Final statistics
    pub stats: RuntimeStats,
}

/// A running task-execution fabric
pub struct Runtime<R: Send + 'static> {
    config: RuntimeConfig,
    queue: Arc<TaskQueue>,
    gate: Arc<TokenGate>,
    breaker: CircuitBreaker,
    pool: Arc<ResourcePool<R>>,
    cache: Arc<ShardStore<String, Value>>,
    batch: Arc<BatchSink<TaskOutcome>>,
    scheduler: Scheduler,
    executor: ExecutorPool,
    intervals: Vec<IntervalHandle>,
    debouncers: HashMap<String, DebounceHandle>,
    sweeper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<R: Send + 'static> Runtime<R> {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder<R> {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn gate(&self) -> &TokenGate {
        &self.gate
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ShardStore<String, Value> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Trigger handle of a configured debounced schedule
    pub fn debouncer(&self, name: &str) -> Option<&DebounceHandle> {
        self.debouncers.get(name)
    }

    /// Handles of all configured debounced schedules
    pub fn debouncers(&self) -> impl Iterator<Item = &DebounceHandle> {
        self.debouncers.values()
    }

    /// Control handle of a configured interval schedule
    pub fn interval(&self, name: &str) -> Option<&IntervalHandle> {
        self.intervals.iter().find(|handle| handle.name() == name)
    }

    /// Enqueue a one-off task, honouring the queue policy
    pub async fn submit(&self, template: &TaskTemplate, params: Option<Value>) -> Result<TaskId> {
        self.scheduler.submit(template, params).await
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            executor: self.executor.stats(),
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            batch: self.batch.stats(),
            queue_depth: self.queue.len(),
            breaker_state: self.breaker.state().name(),
        }
    }

    /// Stop producing, let workers finish their current task, flush the
    /// last batch and stop background tasks
    ///
    /// Tasks still queued are discarded and counted. A failure of the final
    /// flush is returned after everything else has stopped.
    pub async fn shutdown(mut self) -> Result<ShutdownReport> {
        info!("runtime shutting down");

        self.scheduler.stop_all();
        for handle in &self.intervals {
            handle.stop().await;
        }

        self.executor.stop().await;

        self.queue.close();
        let discarded = self.queue.drain();
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "discarding pending tasks");
        }

        let flushed = self.batch.shutdown().await;

        self.cancel.cancel();
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        self.pool.clear_idle();

        let report = ShutdownReport {
            discarded_tasks: discarded.len(),
            stats: self.stats(),
        };
        info!(
            discarded = report.discarded_tasks,
            stats = %report.stats.summary(),
            "runtime stopped"
        );

        flushed?;
        Ok(report)
    }
}

impl<R: Send + 'static> Drop for Runtime<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.scheduler.stop_all();
    }
}
