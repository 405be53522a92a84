/*!
 * Configuration types for Strand
 */

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StrandError};

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pending task buffer
    #[serde(default)]
    pub queue: QueueConfig,

    /// Token gate in front of the protected call
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker around the protected call
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Sharded result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Batching of results headed for persistence
    #[serde(default)]
    pub batch: BatchConfig,

    /// Reusable backend resources
    #[serde(default)]
    pub pool: PoolConfig,

    /// Worker pool
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scheduled task registrations
    #[serde(default, rename = "schedule", skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleConfig>,
}

/// What enqueue does when the task queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueFullPolicy {
    /// Wait for space
    #[default]
    Block,

    /// Evict the oldest pending task to make room
    DropOldest,

    /// Refuse the new task
    Reject,
}

/// What a worker does with a task the token gate denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitedPolicy {
    /// Drop the task and report it
    #[default]
    Drop,

    /// Wait for the next token, then put the task back on the queue
    Requeue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending tasks
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Backpressure policy when full
    #[serde(default)]
    pub policy: QueueFullPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size (maximum stored tokens)
    #[serde(default = "default_rate_capacity")]
    pub capacity: u64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Time the circuit stays open before a trial call
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of independently locked shards
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Time between background sweeps of expired entries
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// TTL for schedules that cache without naming one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per flush
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Maximum age of the oldest unflushed item
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle handles retained for reuse
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline handed to each protected call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Handling of tasks the token gate denies
    #[serde(default)]
    pub rate_limited_policy: RateLimitedPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// One scheduled registration
///
/// Exactly one of `interval_ms` (fixed-interval) and `debounce_ms`
/// (trigger-driven) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Unique registration name
    pub name: String,

    /// Operation handler to invoke
    pub operation: String,

    /// Emit one task every this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    /// Minimum spacing between triggered tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,

    /// Cache the result under this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    /// TTL for the cached result (defaults to `cache.default_ttl_ms`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,

    /// Send the result to the persistence sink
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Parameters passed to the handler
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// How a schedule produces tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Interval(Duration),
    Debounced(Duration),
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// Everything
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_rate_capacity() -> u64 {
    100
}

fn default_refill_rate() -> f64 {
    50.0
}

fn default_max_failures() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_shard_count() -> usize {
    16
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_pool_capacity() -> usize {
    8
}

fn default_workers() -> usize {
    4
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            policy: QueueFullPolicy::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_ttl_ms: default_ttl_ms(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            timeout_ms: default_batch_timeout_ms(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            call_timeout_ms: default_call_timeout_ms(),
            rate_limited_policy: RateLimitedPolicy::default(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ScheduleConfig {
    /// Fixed-interval registration
    pub fn interval(
        name: impl Into<String>,
        operation: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            params: serde_json::Value::Null,
            interval_ms: Some(interval.as_millis() as u64),
            debounce_ms: None,
            cache_key: None,
            cache_ttl_ms: None,
            persist: true,
        }
    }

    /// Trigger-driven registration
    pub fn debounced(
        name: impl Into<String>,
        operation: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            interval_ms: None,
            debounce_ms: Some(window.as_millis() as u64),
            ..Self::interval(name, operation, Duration::ZERO)
        }
    }

    /// Resolve the schedule mode, rejecting ambiguous entries
    pub fn kind(&self) -> Result<ScheduleKind> {
        match (self.interval_ms, self.debounce_ms) {
            (Some(0), None) => Err(StrandError::Config(format!(
                "schedule '{}': interval_ms must be greater than zero",
                self.name
            ))),
            (Some(ms), None) => Ok(ScheduleKind::Interval(Duration::from_millis(ms))),
            (None, Some(ms)) => Ok(ScheduleKind::Debounced(Duration::from_millis(ms))),
            (Some(_), Some(_)) => Err(StrandError::Config(format!(
                "schedule '{}': set either interval_ms or debounce_ms, not both",
                self.name
            ))),
            (None, None) => Err(StrandError::Config(format!(
                "schedule '{}': one of interval_ms or debounce_ms is required",
                self.name
            ))),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A starter configuration with one schedule of each kind
    pub fn example() -> Self {
        let mut poll = ScheduleConfig::interval("poll-prices", "fetch", Duration::from_secs(1));
        poll.params = serde_json::json!({ "symbol": "ACME" });
        poll.cache_key = Some("prices:ACME".to_string());

        let mut refresh =
            ScheduleConfig::debounced("refresh-report", "aggregate", Duration::from_secs(2));
        refresh.params = serde_json::json!({ "report": "daily" });

        Self {
            schedules: vec![poll, refresh],
            ..Self::default()
        }
    }

    /// Validate the configuration
    ///
    /// Any error here is fatal: the runtime refuses to start.
    pub fn validate(&self) -> Result<()> {
        if self.executor.workers == 0 {
            return Err(StrandError::Config(
                "executor.workers must be greater than zero".to_string(),
            ));
        }

        if self.executor.call_timeout_ms == 0 {
            return Err(StrandError::Config(
                "executor.call_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(StrandError::Config(
                "queue.capacity must be greater than zero".to_string(),
            ));
        }

        if self.rate_limit.capacity == 0 {
            return Err(StrandError::Config(
                "rate_limit.capacity must be greater than zero".to_string(),
            ));
        }

        if !self.rate_limit.refill_rate.is_finite() || self.rate_limit.refill_rate < 0.0 {
            return Err(StrandError::Config(format!(
                "rate_limit.refill_rate must be a non-negative number, got {}",
                self.rate_limit.refill_rate
            )));
        }

        if self.rate_limit.refill_rate > 0.0
            && Duration::try_from_secs_f64(1.0 / self.rate_limit.refill_rate).is_err()
        {
            return Err(StrandError::Config(format!(
                "rate_limit.refill_rate {} is too small to ever produce a token",
                self.rate_limit.refill_rate
            )));
        }

        if self.breaker.max_failures == 0 {
            return Err(StrandError::Config(
                "breaker.max_failures must be greater than zero".to_string(),
            ));
        }

        if self.cache.shard_count == 0 {
            return Err(StrandError::Config(
                "cache.shard_count must be greater than zero".to_string(),
            ));
        }

        if self.cache.sweep_interval_ms == 0 {
            return Err(StrandError::Config(
                "cache.sweep_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.batch.size == 0 {
            return Err(StrandError::Config(
                "batch.size must be greater than zero".to_string(),
            ));
        }

        if self.batch.timeout_ms == 0 {
            return Err(StrandError::Config(
                "batch.timeout_ms must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for schedule in &self.schedules {
            if schedule.name.is_empty() {
                return Err(StrandError::Config(
                    "schedule name must not be empty".to_string(),
                ));
            }
            if !names.insert(schedule.name.as_str()) {
                return Err(StrandError::Config(format!(
                    "duplicate schedule name '{}'",
                    schedule.name
                )));
            }
            schedule.kind()?;
        }

        Ok(())
    }
}
