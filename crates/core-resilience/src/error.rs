//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the gate, breaker and pool, and by protected calls
/// running underneath them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Circuit breaker is half-open and its single trial slot is taken
    #[error("Circuit breaker trial call already in flight")]
    TrialInFlight,

    /// Token gate had no token available
    #[error("Rate limit exceeded, retry after refill")]
    RateLimited,

    /// The protected call failed in a way that may succeed later
    #[error("Transient error: {0}")]
    Transient(String),

    /// Resource factory could not produce a handle
    #[error("Failed to acquire resource: {0}")]
    ResourceAcquisition(String),

    /// The protected call did not finish before its deadline
    #[error("Operation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// A primitive was constructed with unusable parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// The operation was never attempted; the caller may try again later.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::TrialInFlight
                | ResilienceError::RateLimited
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !self.is_rejection() && !matches!(self, ResilienceError::InvalidConfig(_))
    }

    /// Check if this error is transient and a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::ResourceAcquisition(_)
                | ResilienceError::DeadlineExceeded(_)
        ) || self.is_rejection()
    }
}
