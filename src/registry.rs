//! Adapter registry: named presets so callers don't hand-roll an
//! `AdapterConfig` for every dependency (spec.md §4.3 "Registry").
//!
//! Presets carry over the original `create_database_adapter` /
//! `create_api_adapter` / `create_llm_adapter` literal numbers: a
//! database dependency gets a short timeout and a wide bulkhead, an
//! LLM dependency gets a long timeout and a narrow one. The original's
//! `max_retries` counts retries *after* the first attempt, while this
//! crate's `max_attempts` counts the first attempt too, so each preset
//! here is the original's `max_retries + 1`.

use crate::adapter::ResilientAdapter;
use crate::config::AdapterConfig;
use crate::event_log::EventLog;
use crate::kvs::KeyValueStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Creates and caches named `ResilientAdapter`s so repeated calls for
/// the same logical dependency return the same breaker/bulkhead/stats
/// state instead of a fresh one each time.
pub struct AdapterRegistry {
    kvs: Arc<dyn KeyValueStore>,
    event_log: Arc<dyn EventLog>,
    adapters: Mutex<HashMap<String, Arc<ResilientAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(kvs: Arc<dyn KeyValueStore>, event_log: Arc<dyn EventLog>) -> Self {
        Self {
            kvs,
            event_log,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create a database-profile adapter: short timeout, tight
    /// breaker, wide bulkhead.
    pub async fn database(&self, name: impl Into<String>) -> Arc<ResilientAdapter> {
        self.get_or_create(name.into(), database_config()).await
    }

    /// Get or create an api-profile adapter: medium timeout and
    /// concurrency, matches `AdapterConfig::default()`.
    pub async fn api(&self, name: impl Into<String>) -> Arc<ResilientAdapter> {
        self.get_or_create(name.into(), api_config()).await
    }

    /// Get or create an llm-profile adapter: long timeout, few
    /// retries, narrow bulkhead.
    pub async fn llm(&self, name: impl Into<String>) -> Arc<ResilientAdapter> {
        self.get_or_create(name.into(), llm_config()).await
    }

    /// Get or create an adapter with a caller-supplied configuration.
    pub async fn custom(&self, name: impl Into<String>, config: AdapterConfig) -> Arc<ResilientAdapter> {
        self.get_or_create(name.into(), config).await
    }

    /// All adapter names currently registered.
    pub async fn names(&self) -> Vec<String> {
        self.adapters.lock().await.keys().cloned().collect()
    }

    /// Remove an adapter from the registry, e.g. to force re-creation
    /// with a different configuration.
    pub async fn remove(&self, name: &str) -> Option<Arc<ResilientAdapter>> {
        self.adapters.lock().await.remove(name)
    }

    async fn get_or_create(&self, name: String, config: AdapterConfig) -> Arc<ResilientAdapter> {
        let mut guard = self.adapters.lock().await;
        if let Some(existing) = guard.get(&name) {
            return Arc::clone(existing);
        }
        let adapter = Arc::new(ResilientAdapter::new(
            name.clone(),
            config,
            Arc::clone(&self.kvs),
            Arc::clone(&self.event_log),
        ));
        guard.insert(name, Arc::clone(&adapter));
        adapter
    }
}

fn database_config() -> AdapterConfig {
    AdapterConfig {
        per_attempt_timeout: Duration::from_secs(30),
        max_attempts: 4,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        failure_threshold: 5,
        recovery_timeout: Duration::from_secs(60),
        bulkhead_capacity: 20,
        bulkhead_acquire_timeout: Duration::from_secs(1),
        idempotency_ttl: Duration::from_secs(3600),
    }
}

fn api_config() -> AdapterConfig {
    AdapterConfig {
        per_attempt_timeout: Duration::from_secs(45),
        max_attempts: 4,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(120),
        bulkhead_capacity: 10,
        bulkhead_acquire_timeout: Duration::from_secs(1),
        idempotency_ttl: Duration::from_secs(3600),
    }
}

fn llm_config() -> AdapterConfig {
    AdapterConfig {
        per_attempt_timeout: Duration::from_secs(120),
        max_attempts: 3,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(300),
        bulkhead_capacity: 5,
        bulkhead_acquire_timeout: Duration::from_secs(1),
        idempotency_ttl: Duration::from_secs(3600),
    }
}
