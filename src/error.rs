//! Error taxonomy for the reliability substrate

use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors surfaced by the resilient adapter and saga coordinator.
///
/// Every variant maps to a semantic kind from the error taxonomy; the
/// breaker/retry impact of each kind lives in `adapter.rs`, not here.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("operation '{op}' timed out after {0:?}", timeout)]
    Timeout { op: String, timeout: std::time::Duration },

    #[error("circuit open for '{0}', next attempt at a later time")]
    CircuitOpen(String),

    #[error("bulkhead rejected '{0}': no slot available within acquire timeout")]
    BulkheadRejected(String),

    #[error("operation '{op}' failed: {source}")]
    OperationError {
        op: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("compensation for step '{step}' failed: {source}")]
    CompensationError {
        step: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("saga '{0}' not found")]
    SagaNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A terminal error the caller has opted out of retry for (see
    /// spec.md §9, Open question 1). The retry engine re-raises the
    /// inner error without sleeping or counting remaining attempts.
    #[error(transparent)]
    Terminal(Box<AdapterError>),
}

impl AdapterError {
    /// Wrap this error so the retry engine treats it as non-retryable.
    pub fn terminal(self) -> Self {
        AdapterError::Terminal(Box::new(self))
    }

    /// Whether the breaker should count this outcome as a failure.
    ///
    /// Per spec.md §7: Timeout and OperationError count on exhaustion;
    /// CircuitOpen, BulkheadRejected, CacheError, and Cancelled do not.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            AdapterError::Terminal(inner) => inner.counts_as_breaker_failure(),
            AdapterError::Timeout { .. } | AdapterError::OperationError { .. } => true,
            AdapterError::CircuitOpen(_)
            | AdapterError::BulkheadRejected(_)
            | AdapterError::CacheError(_)
            | AdapterError::Cancelled
            | AdapterError::Config(_)
            | AdapterError::SagaNotFound(_)
            | AdapterError::Serialization(_)
            | AdapterError::CompensationError { .. } => false,
        }
    }

    /// Error category for logging/metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            AdapterError::Timeout { .. } => "timeout",
            AdapterError::CircuitOpen(_) => "circuit_open",
            AdapterError::BulkheadRejected(_) => "bulkhead_rejected",
            AdapterError::OperationError { .. } => "operation_error",
            AdapterError::CacheError(_) => "cache_error",
            AdapterError::CompensationError { .. } => "compensation_error",
            AdapterError::Cancelled => "cancelled",
            AdapterError::Config(_) => "config",
            AdapterError::SagaNotFound(_) => "saga_not_found",
            AdapterError::Serialization(_) => "serialization",
            AdapterError::Terminal(inner) => inner.category(),
        }
    }
}
