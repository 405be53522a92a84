/*!
 * Integration tests for runtime composition
 *
 * Schedules, queue, executor, cache and batch sink wired together by the
 * runtime builder, checked from the outside.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use strand::config::{RateLimitedPolicy, RuntimeConfig, ScheduleConfig};
use strand::core::{
    OperationHandler, PersistenceSink, ResultDestination, TaskOutcome, TaskTemplate,
    TriggerOutcome,
};
use strand::observability::EventCapture;
use strand::output::JsonLinesSink;
use strand::resilience::{ResilienceError, ResourceFactory};
use strand::runtime::{Runtime, RuntimeBuilder};

struct Conn;
struct Factory;

#[async_trait]
impl ResourceFactory<Conn> for Factory {
    async fn create(&self) -> Result<Conn, ResilienceError> {
        Ok(Conn)
    }
}

/// Echoes its parameters after an optional delay
struct Echo {
    delay: Duration,
}

#[async_trait]
impl OperationHandler<Conn> for Echo {
    async fn call(
        &self,
        _: &mut Conn,
        params: &Value,
        _: Instant,
    ) -> Result<Value, ResilienceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(json!({ "echo": params }))
    }
}

/// Keeps every batch it receives
#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<TaskOutcome>>>,
}

impl Recorder {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl PersistenceSink<TaskOutcome> for Recorder {
    async fn persist(&self, items: Vec<TaskOutcome>) -> strand::Result<()> {
        self.batches.lock().push(items);
        Ok(())
    }
}

fn builder(
    config: RuntimeConfig,
    delay: Duration,
    persistence: Arc<dyn PersistenceSink<TaskOutcome>>,
) -> RuntimeBuilder<Conn> {
    Runtime::builder(config)
        .factory(Arc::new(Factory))
        .persistence(persistence)
        .handler("echo", Arc::new(Echo { delay }))
}

#[tokio::test(start_paused = true)]
async fn test_interval_schedule_fills_cache() {
    let mut schedule = ScheduleConfig::interval("poll", "echo", Duration::from_millis(100));
    schedule.cache_key = Some("latest".to_string());
    schedule.persist = false;
    schedule.params = json!({ "symbol": "ABC" });
    let config = RuntimeConfig {
        schedules: vec![schedule],
        ..Default::default()
    };

    let recorder = Arc::new(Recorder::default());
    let runtime = builder(config, Duration::ZERO, recorder.clone())
        .start()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(
        runtime.cache().get("latest"),
        Some(json!({ "echo": { "symbol": "ABC" } }))
    );
    assert_eq!(runtime.interval("poll").unwrap().emitted(), 4);

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.stats.executor.completed, 4);
    // Nothing was routed to persistence
    assert!(recorder.batch_sizes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_debounced_triggers_coalesce() {
    let config = RuntimeConfig {
        schedules: vec![ScheduleConfig::debounced(
            "refresh",
            "echo",
            Duration::from_millis(500),
        )],
        ..Default::default()
    };
    let events = Arc::new(EventCapture::new());
    let recorder = Arc::new(Recorder::default());
    let runtime = builder(config, Duration::ZERO, recorder.clone())
        .events(events.clone())
        .start()
        .unwrap();

    let handle = runtime.debouncer("refresh").unwrap().clone();
    assert!(matches!(
        handle.trigger(Some(json!({ "first": true }))),
        TriggerOutcome::Enqueued(_)
    ));
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.trigger(Some(json!({ "later": true }))), TriggerOutcome::Coalesced);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(matches!(handle.trigger(None), TriggerOutcome::Enqueued(_)));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(events.count_kind("trigger_coalesced"), 4);

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.stats.executor.completed, 2);

    // The leading trigger's parameters are the ones that ran
    let batches = recorder.batches.lock();
    let outcomes: Vec<&TaskOutcome> = batches.iter().flatten().collect();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].result, json!({ "echo": { "first": true } }));
    assert_eq!(handle.trigger(None), TriggerOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_results_batched_by_size_and_timeout() {
    let mut config = RuntimeConfig::default();
    config.batch.size = 3;
    config.batch.timeout_ms = 1_000;
    let recorder = Arc::new(Recorder::default());
    let runtime = builder(config, Duration::ZERO, recorder.clone())
        .start()
        .unwrap();

    let template = TaskTemplate::new("echo").with_destination(ResultDestination::persist());
    for i in 0..4 {
        runtime.submit(&template, Some(json!(i))).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.batch_sizes(), vec![3]);

    // The straggler goes out once the timeout passes
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(recorder.batch_sizes(), vec![3, 1]);

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.stats.batch.flushes, 2);
    assert_eq!(report.stats.batch.items_flushed, 4);
    assert_eq!(recorder.batch_sizes(), vec![3, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_partial_batch_and_discards_pending() {
    let mut config = RuntimeConfig::default();
    config.executor.workers = 1;
    config.batch.timeout_ms = 60_000;
    let recorder = Arc::new(Recorder::default());
    let runtime = builder(config, Duration::from_secs(1), recorder.clone())
        .start()
        .unwrap();

    let template = TaskTemplate::new("echo").with_destination(ResultDestination::persist());
    for i in 0..5 {
        runtime.submit(&template, Some(json!(i))).await.unwrap();
    }
    // The single worker has picked up the first task
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.discarded_tasks, 4);
    assert_eq!(report.stats.executor.completed, 1);
    assert_eq!(report.stats.queue_depth, 0);
    assert_eq!(recorder.batch_sizes(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_tasks_requeued() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.capacity = 1;
    config.rate_limit.refill_rate = 10.0;
    config.executor.rate_limited_policy = RateLimitedPolicy::Requeue;
    let events = Arc::new(EventCapture::new());
    let recorder = Arc::new(Recorder::default());
    let runtime = builder(config, Duration::ZERO, recorder)
        .events(events.clone())
        .start()
        .unwrap();

    let template = TaskTemplate::new("echo");
    for i in 0..3 {
        runtime.submit(&template, Some(json!(i))).await.unwrap();
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = runtime.stats().executor;
    assert_eq!(stats.completed, 3);
    assert!(stats.rate_limited >= 2);
    assert_eq!(stats.rate_limited, stats.requeued);
    assert_eq!(events.count_kind("rate_limited") as u64, stats.rate_limited);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outcomes_written_as_json_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink = JsonLinesSink::<TaskOutcome>::open(&path).await.unwrap();

    let runtime = builder(RuntimeConfig::default(), Duration::ZERO, Arc::new(sink))
        .start()
        .unwrap();
    let template = TaskTemplate::new("echo").with_destination(ResultDestination::persist());
    for i in 0..3 {
        runtime.submit(&template, Some(json!({ "n": i }))).await.unwrap();
    }

    // Shutdown flushes whatever the timer has not
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let mut seen: Vec<i64> = content
        .lines()
        .map(|line| {
            let outcome: TaskOutcome = serde_json::from_str(line).unwrap();
            assert_eq!(outcome.operation, "echo");
            outcome.result["echo"]["n"].as_i64().unwrap()
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
}
