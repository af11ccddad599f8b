//! Reliability substrate for multi-tenant AI orchestration
//!
//! Two cooperating pieces, both persisting through the same
//! `KeyValueStore`:
//!
//! - [`adapter::ResilientAdapter`]: timeout, retry with backoff and
//!   jitter, a circuit breaker, a bulkhead, and an idempotent-result
//!   cache, composed around a single fallible operation.
//! - [`saga::SagaCoordinator`]: ordered or parallel sequences of such
//!   operations, with compensation on failure.
//!
//! Every invocation is write-ahead logged through [`event_log::EventLog`]
//! before it runs, so a crash mid-flight is replayable rather than
//! silently lost.
//!
//! # Example
//!
//! ```rust,no_run
//! use reliant_saga::{AdapterConfig, FnOperation, InMemoryKvs, KvsEventLog, ResilientAdapter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> reliant_saga::Result<()> {
//!     let kvs = Arc::new(InMemoryKvs::new());
//!     let event_log = Arc::new(KvsEventLog::new(kvs.clone()));
//!     let adapter = ResilientAdapter::new("payment", AdapterConfig::default(), kvs, event_log);
//!
//!     let op = FnOperation::new(|| async { Ok("charged".to_string()) });
//!     let result = adapter.execute("authorize", &serde_json::json!({"amount": 100}), op).await?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod breaker;
pub mod bulkhead;
pub mod cache;
pub mod config;
pub mod error;
pub mod event_log;
pub mod kvs;
pub mod registry;
pub mod retry;
pub mod saga;
pub mod stats;

pub use adapter::{FnOperation, Operation, ResilientAdapter};
pub use breaker::{CircuitBreaker, CircuitState, EntryDecision};
pub use bulkhead::Bulkhead;
pub use cache::{derive_key, IdempotencyCache, IdempotencyKey};
pub use config::{AdapterConfig, SagaConfig};
pub use error::{AdapterError, Result};
pub use event_log::{Event, EventLog, EventPhase, KvsEventLog, NullEventLog};
pub use kvs::{FailingKvs, InMemoryKvs, KeyValueStore};
pub use registry::AdapterRegistry;
pub use saga::{
    CompensationPolicy, Saga, SagaCoordinator, SagaMetricsSnapshot, SagaMode, SagaOutcome,
    SagaSnapshot, SagaStatus, SagaStep, StepStatus,
};
pub use stats::{AdapterStats, AdapterStatsSnapshot};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
