//! Token Gate: non-blocking admission control
//!
//! A token bucket that refills continuously at `refill_rate` tokens per second
//! up to `capacity`. [`TokenGate::allow`] never waits: a caller that is denied
//! decides for itself whether to retry, delay or reject.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Mutable bucket state, only touched under the gate's lock
#[derive(Debug)]
struct Bucket {
    /// Whole tokens currently available (0 ≤ tokens ≤ capacity)
    tokens: u64,
    /// Point up to which elapsed time has been converted into tokens
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// # Example
/// ```
/// use strand_core_resilience::TokenGate;
///
/// // Burst of 5, sustained 2 calls per second
/// let gate = TokenGate::new(5, 2.0).unwrap();
///
/// for _ in 0..5 {
///     assert!(gate.allow());
/// }
/// assert!(!gate.allow());
/// ```
#[derive(Debug)]
pub struct TokenGate {
    capacity: u64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl TokenGate {
    /// Create a gate that starts full.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of stored tokens (burst size), must be > 0
    /// * `refill_rate` - Tokens added per second; `0.0` means the bucket never refills
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self, ResilienceError> {
        if capacity == 0 {
            return Err(ResilienceError::InvalidConfig(
                "token gate capacity must be > 0".to_string(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "token gate refill rate must be a non-negative number, got {}",
                refill_rate
            )));
        }
        if refill_rate > 0.0 && token_interval(refill_rate).is_none() {
            return Err(ResilienceError::InvalidConfig(format!(
                "token gate refill rate {} is too small to schedule a token",
                refill_rate
            )));
        }

        Ok(Self {
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Create a gate allowing `requests_per_second` with an equal burst size
    pub fn per_second(requests_per_second: u64) -> Result<Self, ResilienceError> {
        Self::new(requests_per_second, requests_per_second as f64)
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Like [`allow`](Self::allow) but reports denial as [`ResilienceError::RateLimited`]
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.allow() {
            Ok(())
        } else {
            Err(ResilienceError::RateLimited)
        }
    }

    /// Tokens available right now
    pub fn available(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    /// How long until the next token is due.
    ///
    /// Returns `Some(Duration::ZERO)` when a token is available now and `None`
    /// when the bucket is empty and never refills.
    pub fn time_until_available(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);

        if bucket.tokens > 0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate == 0.0 {
            return None;
        }

        let next = bucket.last_refill.checked_add(token_interval(self.refill_rate)?)?;
        Some(next.saturating_duration_since(now))
    }

    /// Maximum number of stored tokens
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if bucket.tokens >= self.capacity {
            // Time spent full earns nothing
            bucket.last_refill = now;
            return;
        }
        if self.refill_rate == 0.0 {
            return;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = (elapsed.as_secs_f64() * self.refill_rate).floor();
        if earned < 1.0 {
            return;
        }

        let missing = self.capacity - bucket.tokens;
        if earned >= missing as f64 {
            bucket.tokens = self.capacity;
            bucket.last_refill = now;
        } else {
            bucket.tokens += earned as u64;
            // Keep the fractional remainder for the next call
            bucket.last_refill = Duration::try_from_secs_f64(earned / self.refill_rate)
                .ok()
                .and_then(|spent| bucket.last_refill.checked_add(spent))
                .map_or(now, |at| at.min(now));
        }
    }
}

/// Time between two tokens, `None` when it does not fit in a [`Duration`]
fn token_interval(refill_rate: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / refill_rate).ok()
}
