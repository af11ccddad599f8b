//! Key-value store interface (spec.md §6)
//!
//! The crate talks to its environment only through this trait: opaque
//! get/set-with-TTL/delete over a single key, single round-trip,
//! single-key atomicity. A real deployment backs this with Redis, etcd,
//! or similar — that implementation is an external collaborator
//! (spec.md §1) and is out of scope here. `InMemoryKvs` is the
//! reference implementation used by tests and as a sensible default.

use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Typed get/set-with-TTL/delete over opaque bytes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory reference `KeyValueStore`, grounded on
/// `the_agency::unified_storage::InMemoryUnifiedStorage`'s
/// `Arc<RwLock<HashMap<...>>>` shape.
pub struct InMemoryKvs {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryKvs {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn a background task that periodically evicts expired keys.
    /// Entries are also lazily reaped on `get`, so this is an
    /// optimization, not a correctness requirement.
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut guard = entries.write().await;
                let before = guard.len();
                guard.retain(|_, entry| entry.expires_at > now);
                let evicted = before - guard.len();
                if evicted > 0 {
                    debug!(evicted, "reaped expired kvs entries");
                }
            }
        })
    }

    /// Number of live (non-expired) entries; mostly useful for tests.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

impl Default for InMemoryKvs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvs {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            if let Some(entry) = guard.get(key) {
                if entry.expires_at > now {
                    return Ok(Some(entry.value.clone()));
                }
            } else {
                return Ok(None);
            }
        }
        // Expired: reap it under a write lock.
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// A KVS wrapper that always fails, for exercising the "KVS
/// unavailability degrades to cache-miss" path (spec.md §4.1's
/// failure-semantics note).
pub struct FailingKvs;

#[async_trait]
impl KeyValueStore for FailingKvs {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(AdapterError::CacheError("kvs unavailable".to_string()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
        Err(AdapterError::CacheError("kvs unavailable".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(AdapterError::CacheError("kvs unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kvs = InMemoryKvs::new();
        kvs.set("k1", b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let got = kvs.get("k1").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let kvs = InMemoryKvs::new();
        assert_eq!(kvs.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let kvs = InMemoryKvs::new();
        kvs.set("k1", b"hello".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kvs.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let kvs = InMemoryKvs::new();
        kvs.set("k1", b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        kvs.delete("k1").await.unwrap();
        assert_eq!(kvs.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_kvs_degrades_gracefully() {
        let kvs = FailingKvs;
        assert!(kvs.get("k1").await.is_err());
    }
}
