//! Error types for runnable-core.
//!
//! A unit's own failure travels through composers untouched: the variant a
//! unit returns is the variant its caller sees. Foreign error types are
//! carried in [`Error::Unit`] and can be recovered with
//! [`Error::downcast_ref`].

use std::time::Duration;

use thiserror::Error;

/// Result type alias for runnable-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an abort signal was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Raised explicitly by the caller.
    Cancelled,
    /// Raised by a deadline.
    Timeout(Duration),
    /// The consumer of a stream went away before the run completed.
    Dropped,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Timeout(after) => write!(f, "timed out after {after:?}"),
            AbortReason::Dropped => write!(f, "dropped before completion"),
        }
    }
}

/// Main error type for runnable-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A context variable was set outside of any active run.
    #[error("Scope error: {0}")]
    Scope(String),

    /// The configured recursion ceiling was exceeded. Never retried.
    #[error("Recursion limit of {limit} reached without hitting a stop condition")]
    RecursionLimit {
        /// The limit that was exceeded.
        limit: usize,
    },

    /// A cancellation signal fired mid-execution.
    #[error("Aborted: {0}")]
    Aborted(AbortReason),

    /// Per-item failures collected from a partial-failure batch.
    #[error("{} of the batch items failed", .errors.len())]
    AggregateBatch {
        /// One `(input index, error)` pair per failed item.
        errors: Vec<(usize, Error)>,
    },

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP-like status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error converting to or from JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The input did not have the shape the unit expects.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A foreign error raised by a user-supplied unit.
    #[error("{0}")]
    Unit(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Wrap a foreign error raised inside a unit.
    pub fn unit<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Unit(Box::new(error))
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Recover the original error type carried by [`Error::Unit`].
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Unit(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether this error is an abort.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Errors that must end execution immediately: no retry, no fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecursionLimit { .. } | Self::Aborted(_))
    }

    /// Whether this error is worth retrying.
    ///
    /// Returns `true` for transient network/server errors: 429 and 5xx API
    /// responses and IO failures. Validation-class errors (input, config,
    /// JSON) and fatal errors are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Io(_) => true,
            Self::Unit(inner) => inner.downcast_ref::<std::io::Error>().is_some(),
            _ => false,
        }
    }
}
