/*!
 * Simulated backend for `strand run`
 *
 * Connections and operations with random latency and random failures, so
 * the whole fabric (rate limiting, breaker trips, batching, caching) can be
 * exercised without a real downstream.
 */

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strand_core_resilience::{ResilienceError, ResourceFactory};
use tokio::time::Instant;
use tracing::trace;

use crate::core::OperationHandler;
use crate::error::{Result, StrandError};

/// Behaviour of the simulated backend
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    /// Call latency range in milliseconds
    pub latency_ms: RangeInclusive<u64>,
    /// Probability that a call fails
    pub failure_rate: f64,
    /// Probability that opening a connection fails
    pub connect_failure_rate: f64,
    /// Calls after which a connection is retired instead of reused
    pub max_calls_per_connection: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            latency_ms: 10..=80,
            failure_rate: 0.05,
            connect_failure_rate: 0.0,
            max_calls_per_connection: 1_000,
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("failure rate", self.failure_rate),
            ("connect failure rate", self.connect_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(StrandError::Config(format!(
                    "{} must be between 0 and 1, got {}",
                    name, rate
                )));
            }
        }
        if self.latency_ms.is_empty() {
            return Err(StrandError::Config(
                "minimum latency must not exceed maximum latency".to_string(),
            ));
        }
        Ok(())
    }
}

/// A pretend connection
#[derive(Debug)]
pub struct SimulatedConnection {
    pub id: u64,
    pub calls: u64,
}

/// Opens [`SimulatedConnection`]s
#[derive(Debug)]
pub struct SimulatedFactory {
    settings: SimulationSettings,
    next_id: AtomicU64,
}

impl SimulatedFactory {
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            settings,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ResourceFactory<SimulatedConnection> for SimulatedFactory {
    async fn create(&self) -> std::result::Result<SimulatedConnection, ResilienceError> {
        let refused = rand::rng().random_bool(self.settings.connect_failure_rate);
        if refused {
            return Err(ResilienceError::ResourceAcquisition(
                "simulated connection refused".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(connection = id, "simulated connection opened");
        Ok(SimulatedConnection { id, calls: 0 })
    }

    fn is_healthy(&self, connection: &SimulatedConnection) -> bool {
        connection.calls < self.settings.max_calls_per_connection
    }
}

/// An operation answering with a random reading after a random delay
#[derive(Debug)]
pub struct SimulatedOperation {
    name: String,
    settings: SimulationSettings,
}

impl SimulatedOperation {
    pub fn new(name: impl Into<String>, settings: SimulationSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }
}

#[async_trait]
impl OperationHandler<SimulatedConnection> for SimulatedOperation {
    async fn call(
        &self,
        connection: &mut SimulatedConnection,
        params: &Value,
        _deadline: Instant,
    ) -> std::result::Result<Value, ResilienceError> {
        // ThreadRng is not Send; draw everything before the first await
        let (latency, fails, reading) = {
            let mut rng = rand::rng();
            (
                Duration::from_millis(rng.random_range(self.settings.latency_ms.clone())),
                rng.random_bool(self.settings.failure_rate),
                rng.random::<f64>(),
            )
        };

        // The caller enforces the deadline; a slow call simply overruns it
        connection.calls += 1;
        tokio::time::sleep(latency).await;

        if fails {
            return Err(ResilienceError::Transient(format!(
                "simulated {} failure",
                self.name
            )));
        }

        Ok(json!({
            "operation": self.name,
            "params": params,
            "connection": connection.id,
            "latency_ms": latency.as_millis() as u64,
            "reading": reading,
        }))
    }
}
