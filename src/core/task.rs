/*!
 * Task descriptors
 *
 * A task names an operation, carries its JSON parameters and says where the
 * result goes. Tasks are plain data; the handler registry turns them into
 * calls.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub type TaskId = u64;

/// Cache placement for a successful result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub key: String,
    pub ttl: Duration,
}

/// Where a successful result is written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultDestination {
    pub cache: Option<CacheTarget>,
    pub persist: bool,
}

impl ResultDestination {
    /// Discard the result
    pub fn none() -> Self {
        Self::default()
    }

    /// Send the result to the batch sink
    pub fn persist() -> Self {
        Self {
            cache: None,
            persist: true,
        }
    }

    /// Cache the result under `key` for `ttl`
    pub fn cache(key: impl Into<String>, ttl: Duration) -> Self {
        Self::none().with_cache(key, ttl)
    }

    pub fn with_cache(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.cache = Some(CacheTarget {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// One unit of work, consumed by exactly one worker
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub operation: String,
    pub params: Value,
    pub destination: ResultDestination,
    pub created_at: Instant,
}

impl Task {
    pub fn new(
        id: TaskId,
        operation: impl Into<String>,
        params: Value,
        destination: ResultDestination,
    ) -> Self {
        Self {
            id,
            operation: operation.into(),
            params,
            destination,
            created_at: Instant::now(),
        }
    }

    /// Time spent since the task was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Blueprint a schedule stamps tasks from
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub operation: String,
    pub params: Value,
    pub destination: ResultDestination,
}

impl TaskTemplate {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Value::Null,
            destination: ResultDestination::none(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_destination(mut self, destination: ResultDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Stamp a task, optionally overriding the template's parameters
    pub fn instantiate(&self, id: TaskId, params: Option<Value>) -> Task {
        Task::new(
            id,
            self.operation.clone(),
            params.unwrap_or_else(|| self.params.clone()),
            self.destination.clone(),
        )
    }
}

/// Process-wide task id source
#[derive(Debug)]
pub struct TaskIds {
    next: AtomicU64,
}

impl TaskIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TaskId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TaskIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A successful result on its way to the persistence sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub operation: String,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_instantiation() {
        let template = TaskTemplate::new("fetch")
            .with_params(json!({ "symbol": "ACME" }))
            .with_destination(
                ResultDestination::cache("k", Duration::from_secs(5)).with_persist(true),
            );

        let task = template.instantiate(7, None);
        assert_eq!(task.id, 7);
        assert_eq!(task.operation, "fetch");
        assert_eq!(task.params["symbol"], "ACME");
        assert!(task.destination.persist);
        assert_eq!(task.destination.cache.as_ref().unwrap().key, "k");

        let overridden = template.instantiate(8, Some(json!({ "symbol": "XYZ" })));
        assert_eq!(overridden.params["symbol"], "XYZ");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let ids = TaskIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_outcome_serializes_as_json_line() {
        let outcome = TaskOutcome {
            task_id: 3,
            operation: "fetch".to_string(),
            result: json!({ "price": 10 }),
            completed_at: Utc::now(),
        };
        let line = serde_json::to_string(&outcome).unwrap();
        assert!(!line.contains('\n'));
        let back: TaskOutcome = serde_json::from_str(&line).unwrap();
        assert_eq!(back, outcome);
    }
}
