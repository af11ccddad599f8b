//! The Resilient Adapter (spec.md §4.1)
//!
//! Composes the KVS-backed idempotency cache, circuit breaker,
//! bulkhead, retry engine, and write-ahead event log into the single
//! `execute` contract described in spec.md §4.1's entry algorithm.

use crate::breaker::{CircuitBreaker, EntryDecision};
use crate::bulkhead::Bulkhead;
use crate::cache::{derive_key, IdempotencyCache};
use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::event_log::{self, Event, EventLog};
use crate::kvs::KeyValueStore;
use crate::stats::{AdapterStats, AdapterStatsSnapshot};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A handle to a user operation: invoking it yields either a value or a
/// classified error (spec.md §6, §9's "small capability interface").
#[async_trait]
pub trait Operation: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;

    async fn call(&self) -> Result<Self::Output>;
}

/// Adapts any `Fn() -> Future<Output = Result<T>>` into an `Operation`,
/// so callers rarely need to hand-write a struct.
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> Operation for FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T>> + Send,
    T: Serialize + DeserializeOwned + Send,
{
    type Output = T;

    async fn call(&self) -> Result<T> {
        (self.f)().await
    }
}

/// Lets a shared, dynamically-dispatched operation (as the saga
/// coordinator stores per step) be handed to `ResilientAdapter::execute`
/// directly, without a wrapper struct.
#[async_trait]
impl Operation for Arc<dyn Operation<Output = serde_json::Value>> {
    type Output = serde_json::Value;

    async fn call(&self) -> Result<serde_json::Value> {
        (**self).call().await
    }
}

/// The resilient adapter: one instance typically scopes one logical
/// adapter name (e.g. `"payment"`), serving possibly several named
/// operations (`"authorize"`, `"capture"`) each with their own
/// breaker/bulkhead/stats scope (spec.md §9, Open question 2).
pub struct ResilientAdapter {
    name: String,
    config: AdapterConfig,
    kvs: Arc<dyn KeyValueStore>,
    event_log: Arc<dyn EventLog>,
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    stats: Mutex<HashMap<String, Arc<AdapterStats>>>,
}

impl ResilientAdapter {
    pub fn new(
        name: impl Into<String>,
        config: AdapterConfig,
        kvs: Arc<dyn KeyValueStore>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.recovery_timeout);
        let bulkhead = Bulkhead::new(config.bulkhead_capacity, config.bulkhead_acquire_timeout);
        Self {
            name: name.into(),
            config,
            kvs,
            event_log,
            breaker,
            bulkhead,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    async fn stats_for(&self, op_name: &str) -> Arc<AdapterStats> {
        let mut guard = self.stats.lock().await;
        Arc::clone(
            guard
                .entry(op_name.to_string())
                .or_insert_with(|| Arc::new(AdapterStats::new())),
        )
    }

    /// Read-only snapshot of an operation's counters and breaker state.
    pub async fn stats(&self, op_name: &str) -> AdapterStatsSnapshot {
        let stats = self.stats_for(op_name).await;
        let state = self.breaker.state(op_name).await;
        stats.snapshot(state)
    }

    pub async fn reset_stats(&self, op_name: &str) {
        self.stats_for(op_name).await.reset();
        self.breaker.reset(op_name).await;
    }

    /// Execute `operation` (named `op_name`) with full resilience,
    /// following spec.md §4.1's entry algorithm step by step.
    pub async fn execute<O, A>(&self, op_name: &str, args: &A, operation: O) -> Result<O::Output>
    where
        O: Operation,
        A: Serialize + Sync,
    {
        let stats = self.stats_for(op_name).await;
        let cache = IdempotencyCache::new(Arc::clone(&self.kvs), self.name.clone());
        let key = derive_key(&self.name, op_name, args)?;
        let args_digest = key.0.clone();

        stats.incr_total();

        // Step 2: idempotency cache lookup short-circuits everything else.
        if let Some(cached) = cache.get::<O::Output>(&key).await {
            debug!(adapter = %self.name, op = op_name, "idempotency cache hit");
            return Ok(cached);
        }

        // Step 3: circuit breaker check.
        match self.breaker.check_entry(op_name).await {
            EntryDecision::Reject => {
                stats.incr_circuit_rejections();
                return Err(AdapterError::CircuitOpen(op_name.to_string()));
            }
            EntryDecision::Proceed { .. } => {}
        }

        // Step 4: bulkhead.
        let _permit = match self.bulkhead.acquire(op_name).await {
            Some(permit) => permit,
            None => {
                stats.incr_bulkhead_rejections();
                return Err(AdapterError::BulkheadRejected(op_name.to_string()));
            }
        };

        // Step 5: requested event.
        event_log::record_best_effort(
            self.event_log.as_ref(),
            &Event::requested(&self.name, &key.0, op_name, &args_digest),
            self.config.idempotency_ttl,
        )
        .await;

        // Step 6: retry loop.
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let config = self.config.clone();
        let result = crate::retry::retry_with_backoff(op_name, &config, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            operation.call()
        })
        .await;

        let attempts = attempts.load(std::sync::atomic::Ordering::Relaxed);
        if attempts > 1 {
            stats.add_retries(attempts - 1);
        }

        match result {
            Ok(value) => {
                // Step 6/7: breaker success accounting.
                self.breaker.record_success(op_name).await;

                // Best-effort cache write (spec.md: failure doesn't undo success).
                // A payload that can't be turned into an event-log value (e.g. a
                // map with non-string keys) must not turn a real success into a
                // reported error, so this falls back to `Null` rather than `?`.
                let value_json = serde_json::to_value(&value).unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "event-log payload serialization failed");
                    serde_json::Value::Null
                });
                if let Err(err) = cache.set(&key, &value, self.config.idempotency_ttl).await {
                    tracing::warn!(error = %err, "idempotency cache write failed");
                }

                event_log::record_best_effort(
                    self.event_log.as_ref(),
                    &Event::succeeded(&self.name, &key.0, op_name, &args_digest, value_json),
                    self.config.idempotency_ttl,
                )
                .await;

                stats.incr_succeeded();
                Ok(value)
            }
            Err(err) => {
                if err.counts_as_breaker_failure() {
                    self.breaker.record_failure(op_name).await;
                }

                event_log::record_best_effort(
                    self.event_log.as_ref(),
                    &Event::failed(&self.name, &key.0, op_name, &args_digest, err.to_string()),
                    self.config.idempotency_ttl,
                )
                .await;

                // Exactly one terminal bucket per outcome (spec.md §8 I-2).
                if matches!(err, AdapterError::Timeout { .. }) {
                    stats.incr_timed_out();
                } else {
                    stats.incr_failed();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::NullEventLog;
    use crate::kvs::InMemoryKvs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn adapter(config: AdapterConfig) -> ResilientAdapter {
        let kvs: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvs::new());
        let event_log: Arc<dyn EventLog> = Arc::new(NullEventLog);
        ResilientAdapter::new("payment", config, kvs, event_log)
    }

    fn fast_config() -> AdapterConfig {
        let mut c = AdapterConfig::default();
        c.max_attempts = 3;
        c.per_attempt_timeout = Duration::from_secs(1);
        c.base_delay = Duration::from_millis(10);
        c.max_delay = Duration::from_millis(20);
        c.failure_threshold = 5;
        c.bulkhead_capacity = 2;
        c
    }

    #[tokio::test]
    async fn transient_failure_then_success_is_cached_and_breaker_stays_closed() {
        let adapter = adapter(fast_config());
        let calls = AtomicU32::new(0);

        let op = FnOperation::new(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AdapterError::OperationError {
                    op: "authorize".into(),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x")),
                })
            } else {
                Ok("ok".to_string())
            }
        });

        let result = adapter
            .execute("authorize", &serde_json::json!({"amount": 10}), op)
            .await;
        assert_eq!(result.unwrap(), "ok");

        let snapshot = adapter.stats("authorize").await;
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.circuit_state, crate::breaker::CircuitState::Closed);
    }

    #[tokio::test]
    async fn cache_hit_invokes_operation_exactly_once() {
        let adapter = adapter(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let args = serde_json::json!({"amount": 5});

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let op = FnOperation::new(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AdapterError>(42i32)
                }
            });
            let result = adapter.execute("authorize", &args, op).await;
            assert_eq!(result.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_rejects_immediately() {
        let mut config = fast_config();
        config.max_attempts = 1;
        config.failure_threshold = 3;
        let adapter = adapter(config);

        for i in 0..3 {
            let op = FnOperation::new(|| async {
                Err::<i32, _>(AdapterError::OperationError {
                    op: "authorize".into(),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x")),
                })
            });
            let args = serde_json::json!({"attempt": i});
            let result = adapter.execute("authorize", &args, op).await;
            assert!(result.is_err());
        }

        let op = FnOperation::new(|| async { Ok::<i32, AdapterError>(1) });
        let result = adapter.execute("authorize", &serde_json::json!({"attempt": 99}), op).await;
        assert!(matches!(result, Err(AdapterError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn bulkhead_rejects_second_concurrent_call_over_capacity() {
        let mut config = fast_config();
        config.bulkhead_capacity = 1;
        config.bulkhead_acquire_timeout = Duration::from_millis(50);
        let adapter = Arc::new(adapter(config));

        let adapter_a = Arc::clone(&adapter);
        let first = tokio::spawn(async move {
            let op = FnOperation::new(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, AdapterError>("first".to_string())
            });
            adapter_a.execute("authorize", &serde_json::json!({"c": 1}), op).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let op = FnOperation::new(|| async { Ok::<_, AdapterError>("second".to_string()) });
        let second = adapter
            .execute("authorize", &serde_json::json!({"c": 2}), op)
            .await;

        assert!(matches!(second, Err(AdapterError::BulkheadRejected(_))));
        assert!(first.await.unwrap().is_ok());

        let snapshot = adapter.stats("authorize").await;
        assert_eq!(snapshot.bulkhead_rejections, 1);
    }
}
