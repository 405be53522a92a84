//! Strand Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the leaf building blocks that keep a shared backend
//! healthy while many workers call into it:
//!
//! - **Token Gate**: Non-blocking token bucket that limits how fast protected
//!   calls may start
//! - **Circuit Breaker**: Fails fast while a downstream is unhealthy and lets a
//!   single trial call test whether it has recovered
//! - **Resource Pool**: Reuses expensive handles (connections, sessions) with a
//!   cap on retained idle handles
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage systems or network protocols
//! - How tasks are scheduled or where results go
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Worker                          │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Token Gate                        │  ← Admission control
//! │  (Token bucket, never blocks)           │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Consecutive failures, 1 trial call)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool                     │  ← Handle reuse
//! │  (Idle cap, lease released on drop)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Backend
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use strand_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError, TokenGate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let gate = TokenGate::new(10, 5.0)?;
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     max_failures: 3,
//!     cooldown: Duration::from_secs(1),
//! });
//!
//! if gate.allow() {
//!     let value = breaker.execute(|| async { Ok::<_, ResilienceError>(42) }).await?;
//!     assert_eq!(value, 42);
//! }
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod rate_limiter;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, TransitionListener};
pub use connection_pool::{Lease, PoolStats, ResourceFactory, ResourcePool};
pub use error::ResilienceError;
pub use rate_limiter::TokenGate;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use strand_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{ResourceFactory, ResourcePool};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::TokenGate;
}
