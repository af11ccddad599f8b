//! Idempotency key derivation and cached-result memoization
//! (spec.md §3, §4.1 step 1-2, §4.3)
//!
//! Generalizes `the_agency::cache::LlmCache`'s get/set/invalidate/stats
//! shape from a hardcoded SQLite backend to any `KeyValueStore`, since
//! spec.md §6 specifies KVS as the storage contract. Key derivation
//! uses `sha2` rather than `DefaultHasher` so the digest is stable
//! across processes and runs, not just within one.

use crate::error::Result;
use crate::kvs::KeyValueStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Opaque content-addressed identifier for one logical invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn storage_key(&self, adapter_name: &str) -> String {
        format!("idem:{}:{}", adapter_name, self.0)
    }
}

/// Derive `(adapter_name, operation_name, canonical(args))` into a
/// stable `IdempotencyKey`. Canonicalization is order-stable: `args` is
/// first serialized to `serde_json::Value` so object-key order never
/// affects the digest (`serde_json::Value`'s `Map` is a `BTreeMap` by
/// default ordering in this crate's serde feature set).
pub fn derive_key<A: Serialize>(
    adapter_name: &str,
    operation_name: &str,
    args: &A,
) -> Result<IdempotencyKey> {
    let canonical = serde_json::to_value(args)?;
    let canonical_bytes = serde_json::to_vec(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(adapter_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(operation_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(&canonical_bytes);

    Ok(IdempotencyKey(format!("{:x}", hasher.finalize())))
}

/// Content-addressed result memoization backed by a `KeyValueStore`.
pub struct IdempotencyCache {
    kvs: Arc<dyn KeyValueStore>,
    adapter_name: String,
}

impl IdempotencyCache {
    pub fn new(kvs: Arc<dyn KeyValueStore>, adapter_name: impl Into<String>) -> Self {
        Self {
            kvs,
            adapter_name: adapter_name.into(),
        }
    }

    /// Look up a cached result. KVS I/O failure is absorbed into a
    /// cache-miss (spec.md §4.1 failure semantics), never surfaced.
    pub async fn get<T: serde::de::DeserializeOwned>(&self, key: &IdempotencyKey) -> Option<T> {
        match self.kvs.get(&key.storage_key(&self.adapter_name)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) | Err(_) => None,
        }
    }

    /// Store a successful result. Best-effort: a write failure is
    /// logged by the caller, never undoes the already-returned success.
    pub async fn set<T: Serialize>(
        &self,
        key: &IdempotencyKey,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kvs.set(&key.storage_key(&self.adapter_name), bytes, ttl).await
    }

    pub async fn invalidate(&self, key: &IdempotencyKey) -> Result<()> {
        self.kvs.delete(&key.storage_key(&self.adapter_name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::InMemoryKvs;

    #[test]
    fn same_inputs_produce_same_key() {
        let k1 = derive_key("payment", "authorize", &serde_json::json!({"a": 1, "b": 2})).unwrap();
        let k2 = derive_key("payment", "authorize", &serde_json::json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_order_does_not_affect_the_digest() {
        let k1 = derive_key("payment", "authorize", &serde_json::json!({"a": 1, "b": 2})).unwrap();
        let k2 = derive_key("payment", "authorize", &serde_json::json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_inputs_produce_different_keys() {
        let k1 = derive_key("payment", "authorize", &serde_json::json!({"a": 1})).unwrap();
        let k2 = derive_key("payment", "authorize", &serde_json::json!({"a": 2})).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn different_adapter_or_op_changes_the_key() {
        let args = serde_json::json!({"a": 1});
        let k1 = derive_key("payment", "authorize", &args).unwrap();
        let k2 = derive_key("payment", "capture", &args).unwrap();
        let k3 = derive_key("email", "authorize", &args).unwrap();
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[tokio::test]
    async fn cache_hit_returns_stored_value() {
        let kvs: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvs::new());
        let cache = IdempotencyCache::new(kvs, "payment");
        let key = derive_key("payment", "authorize", &serde_json::json!({"amount": 42})).unwrap();

        assert!(cache.get::<i32>(&key).await.is_none());
        cache.set(&key, &42i32, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get::<i32>(&key).await, Some(42));
    }

    #[tokio::test]
    async fn invalidate_clears_the_entry() {
        let kvs: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvs::new());
        let cache = IdempotencyCache::new(kvs, "payment");
        let key = derive_key("payment", "authorize", &serde_json::json!({"amount": 1})).unwrap();
        cache.set(&key, &"ok".to_string(), Duration::from_secs(60)).await.unwrap();
        cache.invalidate(&key).await.unwrap();
        assert_eq!(cache.get::<String>(&key).await, None);
    }
}
