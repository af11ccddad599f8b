//! Write-ahead event log (spec.md §1 item 3, §4.3)
//!
//! Records `requested` / `succeeded` / `failed` lifecycle phases for
//! every adapter invocation, keyed `event:{key}:{phase}` so replaying
//! the same `(key, phase)` pair is a safe overwrite, never a duplicate.

use crate::error::Result;
use crate::kvs::KeyValueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lifecycle phase of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Requested,
    Succeeded,
    Failed,
}

impl EventPhase {
    fn as_str(&self) -> &'static str {
        match self {
            EventPhase::Requested => "requested",
            EventPhase::Succeeded => "succeeded",
            EventPhase::Failed => "failed",
        }
    }
}

/// One write-ahead event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub adapter: String,
    pub key: String,
    pub op: String,
    pub args_digest: String,
    pub phase: EventPhase,
    pub timestamp: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Event {
    pub fn requested(adapter: &str, key: &str, op: &str, args_digest: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
            key: key.to_string(),
            op: op.to_string(),
            args_digest: args_digest.to_string(),
            phase: EventPhase::Requested,
            timestamp: Utc::now(),
            result: None,
            error: None,
        }
    }

    pub fn succeeded(adapter: &str, key: &str, op: &str, args_digest: &str, result: serde_json::Value) -> Self {
        Self {
            adapter: adapter.to_string(),
            key: key.to_string(),
            op: op.to_string(),
            args_digest: args_digest.to_string(),
            phase: EventPhase::Succeeded,
            timestamp: Utc::now(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(adapter: &str, key: &str, op: &str, args_digest: &str, error: String) -> Self {
        Self {
            adapter: adapter.to_string(),
            key: key.to_string(),
            op: op.to_string(),
            args_digest: args_digest.to_string(),
            phase: EventPhase::Failed,
            timestamp: Utc::now(),
            result: None,
            error: Some(error),
        }
    }

    fn storage_key(&self) -> String {
        format!("event:{}:{}", self.key, self.phase.as_str())
    }
}

/// Append-only (from the adapter's viewpoint) write of lifecycle events.
///
/// Emissions must never fail the host operation (spec.md §6): callers
/// should treat `record` errors as log-and-continue, which is exactly
/// what `ResilientAdapter` does with every `EventLog` implementation.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record(&self, event: &Event, ttl: Duration) -> Result<()>;
}

/// Default `EventLog` backed by any `KeyValueStore`.
pub struct KvsEventLog {
    kvs: Arc<dyn KeyValueStore>,
}

impl KvsEventLog {
    pub fn new(kvs: Arc<dyn KeyValueStore>) -> Self {
        Self { kvs }
    }
}

#[async_trait]
impl EventLog for KvsEventLog {
    async fn record(&self, event: &Event, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(event)?;
        self.kvs.set(&event.storage_key(), bytes, ttl).await
    }
}

/// No-op `EventLog` for callers that disable replay.
pub struct NullEventLog;

#[async_trait]
impl EventLog for NullEventLog {
    async fn record(&self, _event: &Event, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

/// Record an event, logging (not propagating) any failure — the shared
/// helper `ResilientAdapter` and `SagaCoordinator` both call so a
/// logging failure can never fail the host operation.
pub async fn record_best_effort(log: &dyn EventLog, event: &Event, ttl: Duration) {
    if let Err(err) = log.record(event, ttl).await {
        warn!(error = %err, phase = ?event.phase, key = %event.key, "event log write failed");
    }
}
