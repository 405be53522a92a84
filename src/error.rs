/*!
 * Error types for Strand
 */

use std::fmt;
use std::io;
use strand_core_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrandError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum StrandError {
    /// Invalid or unusable configuration, detected before anything starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// The task queue refused a task
    #[error("Queue error: {0}")]
    Queue(String),

    /// The persistence sink failed to accept a batch
    #[error("Persistence sink error: {0}")]
    Sink(String),

    /// Token gate, breaker or resource pool failure
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The component has been shut down and refuses new work
    #[error("Runtime is shutting down")]
    Shutdown,
}

impl StrandError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StrandError::Config(_) | StrandError::Toml(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error prevents the runtime from starting
    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            StrandError::Config(_) | StrandError::Toml(_) => ErrorCategory::Configuration,
            StrandError::Queue(_) => ErrorCategory::Rejection,
            StrandError::Sink(_) => ErrorCategory::Sink,
            StrandError::Resilience(e) => ErrorCategory::from(e),
            StrandError::Io(_) => ErrorCategory::IoError,
            StrandError::Shutdown => ErrorCategory::Shutdown,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Never attempted: circuit open, trial in flight, rate limited, queue full
    Rejection,
    /// The protected call failed or ran past its deadline
    Transient,
    /// The resource factory could not produce a handle
    ResourceAcquisition,
    /// Batch flush failed
    Sink,
    /// Invalid configuration
    Configuration,
    /// I/O operation errors
    IoError,
    /// Work refused during shutdown
    Shutdown,
}

impl From<&ResilienceError> for ErrorCategory {
    fn from(err: &ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen
            | ResilienceError::TrialInFlight
            | ResilienceError::RateLimited => ErrorCategory::Rejection,
            ResilienceError::Transient(_) | ResilienceError::DeadlineExceeded(_) => {
                ErrorCategory::Transient
            }
            ResilienceError::ResourceAcquisition(_) => ErrorCategory::ResourceAcquisition,
            ResilienceError::InvalidConfig(_) => ErrorCategory::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Rejection => write!(f, "rejection"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::ResourceAcquisition => write!(f, "resource_acquisition"),
            ErrorCategory::Sink => write!(f, "sink"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl From<toml::ser::Error> for StrandError {
    fn from(err: toml::ser::Error) -> Self {
        StrandError::Config(format!("TOML serialize error: {}", err))
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(err: serde_json::Error) -> Self {
        StrandError::Sink(format!("JSON encode error: {}", err))
    }
}
