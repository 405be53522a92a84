/*!
 * End-to-end breaker behaviour through the full runtime
 *
 * Two workers, a queue of ten, a breaker tripping after three failures with a
 * one second cooldown, and one task every 100ms against a backend that keeps
 * failing until told otherwise.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use strand::config::{RuntimeConfig, ScheduleConfig};
use strand::core::{OperationHandler, PersistenceSink, TaskOutcome};
use strand::observability::{EventCapture, EventPayload};
use strand::resilience::{CircuitState, ResilienceError, ResourceFactory};
use strand::runtime::{Runtime, RuntimeBuilder};

struct Conn;
struct Factory;

#[async_trait]
impl ResourceFactory<Conn> for Factory {
    async fn create(&self) -> Result<Conn, ResilienceError> {
        Ok(Conn)
    }
}

/// Records when it was invoked and fails until marked healthy
#[derive(Default)]
struct Backend {
    calls: Mutex<Vec<Instant>>,
    healthy: AtomicBool,
}

impl Backend {
    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    fn recover(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }
}

struct Flaky(Arc<Backend>);

#[async_trait]
impl OperationHandler<Conn> for Flaky {
    async fn call(&self, _: &mut Conn, _: &Value, _: Instant) -> Result<Value, ResilienceError> {
        self.0.calls.lock().push(Instant::now());
        if self.0.healthy.load(Ordering::SeqCst) {
            Ok(json!({ "ok": true }))
        } else {
            Err(ResilienceError::Transient("backend down".to_string()))
        }
    }
}

struct Discard;

#[async_trait]
impl PersistenceSink<TaskOutcome> for Discard {
    async fn persist(&self, _: Vec<TaskOutcome>) -> strand::Result<()> {
        Ok(())
    }
}

fn scenario_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.executor.workers = 2;
    config.queue.capacity = 10;
    config.breaker.max_failures = 3;
    config.breaker.cooldown_ms = 1_000;
    config.schedules = vec![ScheduleConfig::interval(
        "heartbeat",
        "ping",
        Duration::from_millis(100),
    )];
    config
}

fn builder(backend: Arc<Backend>, events: Arc<EventCapture>) -> RuntimeBuilder<Conn> {
    Runtime::builder(scenario_config())
        .factory(Arc::new(Factory))
        .persistence(Arc::new(Discard))
        .handler("ping", Arc::new(Flaky(backend)))
        .events(events)
}

fn transitions(events: &EventCapture) -> Vec<(String, String)> {
    events
        .of_kind("breaker_transition")
        .into_iter()
        .filter_map(|event| match event.payload {
            EventPayload::BreakerTransition { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_rejects_then_tries_again() {
    let backend = Arc::new(Backend::default());
    let events = Arc::new(EventCapture::new());
    let start = Instant::now();
    let runtime = builder(backend.clone(), events.clone()).start().unwrap();

    // Emissions at 0, 100 and 200ms all fail
    tokio::time::sleep_until(start + Duration::from_millis(250)).await;
    assert_eq!(backend.calls().len(), 3);
    assert!(matches!(runtime.breaker().state(), CircuitState::Open { .. }));
    assert_eq!(runtime.breaker().failure_count(), 3);

    // Emissions at 300..=1100ms are refused without touching the backend
    tokio::time::sleep_until(start + Duration::from_millis(1_150)).await;
    assert_eq!(backend.calls().len(), 3);
    assert_eq!(events.count_kind("task_rejected"), 9);
    assert_eq!(runtime.stats().executor.rejected_by_breaker, 9);

    backend.recover();

    // The first emission after the cooldown is the trial
    tokio::time::sleep_until(start + Duration::from_millis(1_350)).await;
    let calls = backend.calls();
    assert!(calls.len() >= 4);
    let trial_at = calls[3] - start;
    assert!(
        trial_at >= Duration::from_millis(1_200) && trial_at <= Duration::from_millis(1_300),
        "trial ran at {:?}",
        trial_at
    );
    assert_eq!(runtime.breaker().state(), CircuitState::Closed);
    assert_eq!(runtime.breaker().failure_count(), 0);

    assert_eq!(
        transitions(&events),
        vec![
            ("closed".to_string(), "open".to_string()),
            ("open".to_string(), "half_open".to_string()),
            ("half_open".to_string(), "closed".to_string()),
        ]
    );

    let report = runtime.shutdown().await.unwrap();
    assert_eq!(report.stats.executor.failed, 3);
    assert!(report.stats.executor.completed >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let backend = Arc::new(Backend::default());
    let events = Arc::new(EventCapture::new());
    let start = Instant::now();
    let runtime = builder(backend.clone(), events.clone()).start().unwrap();

    // Trial fails somewhere in 1200..=1300ms, restarting the cooldown
    tokio::time::sleep_until(start + Duration::from_millis(1_350)).await;
    assert_eq!(backend.calls().len(), 4);
    assert!(matches!(runtime.breaker().state(), CircuitState::Open { .. }));

    let reopened = transitions(&events);
    assert_eq!(reopened.len(), 3);
    assert_eq!(reopened[1], ("open".to_string(), "half_open".to_string()));
    assert_eq!(reopened[2], ("half_open".to_string(), "open".to_string()));

    // No further calls until the new cooldown runs out
    tokio::time::sleep_until(start + Duration::from_millis(2_150)).await;
    assert_eq!(backend.calls().len(), 4);

    runtime.shutdown().await.unwrap();
}
