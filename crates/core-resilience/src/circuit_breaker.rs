//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: A single trial request tests whether the service has recovered
//!
//! Only consecutive failures count toward the threshold: any success while
//! closed resets the counter.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately until `until`
    Open { until: Instant },
    /// Circuit is half-open, one trial request is allowed
    HalfOpen,
}

impl CircuitState {
    /// Short lowercase name, used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub max_failures: u32,
    /// Duration to wait after the last failure before allowing a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Receives every state change of a breaker.
///
/// Called after the breaker's lock has been released; implementations may
/// read the breaker.
pub trait TransitionListener: Send + Sync {
    /// Called once per transition
    fn on_transition(&self, from: CircuitState, to: CircuitState);
}

/// A `(from, to)` state change
type Transition = (CircuitState, CircuitState);

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use strand_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     let result = breaker.execute(|| async {
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    listener: Option<Arc<dyn TransitionListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Whether an admitted call is an ordinary call or the half-open trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Frees the half-open trial slot if the trial future is dropped before it resolves
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.state.lock();
            state.trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
            listener: None,
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Attach a listener notified of every state transition
    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Breaker thresholds
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// When the most recent counted failure happened
    pub fn last_failure(&self) -> Option<Instant> {
        self.state.lock().last_failure
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let from = {
            let mut state = self.state.lock();
            let from = state.state;
            state.state = CircuitState::Closed;
            state.consecutive_failures = 0;
            state.last_failure = None;
            state.trial_in_flight = false;
            from
        };
        self.notify(Some((from, CircuitState::Closed)));
    }

    /// Run `call` under breaker protection.
    ///
    /// When the circuit is open, or half-open with its trial already running,
    /// `call` is not invoked and [`ResilienceError::CircuitOpen`] or
    /// [`ResilienceError::TrialInFlight`] is returned. Errors returned by `call`
    /// count as failures when [`ResilienceError::should_trip_breaker`] says so.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let (admission, transition) = self.admit();
        self.notify(transition);
        let admission = admission?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = call().await;
        guard.armed = false;

        let transition = match &result {
            Ok(_) => self.on_success(admission),
            Err(e) if e.should_trip_breaker() => self.on_failure(admission),
            Err(_) => self.on_neutral(admission),
        };
        self.notify(transition);

        result
    }

    /// Decide whether a call may start, moving Open -> HalfOpen when the cooldown is over
    fn admit(&self) -> (Result<Admission, ResilienceError>, Option<Transition>) {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => (Ok(Admission::Normal), None),
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    (
                        Ok(Admission::Trial),
                        Some((CircuitState::Open { until }, CircuitState::HalfOpen)),
                    )
                } else {
                    (Err(ResilienceError::CircuitOpen), None)
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    (Err(ResilienceError::TrialInFlight), None)
                } else {
                    // A previous trial was abandoned; this caller takes the slot
                    state.trial_in_flight = true;
                    (Ok(Admission::Trial), None)
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) -> Option<Transition> {
        let mut state = self.state.lock();

        match (admission, state.state) {
            (Admission::Normal, CircuitState::Closed) => {
                state.consecutive_failures = 0;
                None
            }
            (Admission::Trial, CircuitState::HalfOpen) => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.trial_in_flight = false;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            }
            // Outcome of a call admitted before the circuit opened; stale
            _ => None,
        }
    }

    fn on_failure(&self, admission: Admission) -> Option<Transition> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match (admission, state.state) {
            (Admission::Normal, CircuitState::Closed) => {
                state.consecutive_failures += 1;
                state.last_failure = Some(now);

                if state.consecutive_failures < self.config.max_failures {
                    return None;
                }
                let to = CircuitState::Open {
                    until: now + self.config.cooldown,
                };
                state.state = to;
                Some((CircuitState::Closed, to))
            }
            (Admission::Trial, CircuitState::HalfOpen) => {
                state.consecutive_failures += 1;
                state.last_failure = Some(now);
                state.trial_in_flight = false;

                let to = CircuitState::Open {
                    until: now + self.config.cooldown,
                };
                state.state = to;
                Some((CircuitState::HalfOpen, to))
            }
            _ => None,
        }
    }

    /// The call failed for a reason that says nothing about downstream health
    fn on_neutral(&self, admission: Admission) -> Option<Transition> {
        if admission == Admission::Trial {
            let mut state = self.state.lock();
            state.trial_in_flight = false;
        }
        None
    }

    /// Report a transition; never called with the state lock held
    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        if from == to {
            return;
        }
        debug!(from = %from, to = %to, "circuit breaker transition");
        if let Some(listener) = &self.listener {
            listener.on_transition(from, to);
        }
    }
}
