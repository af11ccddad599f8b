//! Bulkhead: bounded concurrent entry per operation (spec.md §4.1, §5)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// A counting semaphore of `capacity` permits, one per `OperationID`.
pub struct Bulkhead {
    capacity: usize,
    acquire_timeout: Duration,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Bulkhead {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            capacity,
            acquire_timeout,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    async fn semaphore_for(&self, operation: &str) -> Arc<Semaphore> {
        let mut guard = self.semaphores.lock().await;
        Arc::clone(
            guard
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.capacity))),
        )
    }

    /// Acquire a slot, waiting up to `acquire_timeout`. Returns `None`
    /// on timeout — a rejection, never a breaker failure (spec.md
    /// §4.1 step 4).
    pub async fn acquire(&self, operation: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore_for(operation).await;
        tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    /// In-flight count for `operation`, for `AdapterStats`/diagnostics.
    pub async fn in_flight(&self, operation: &str) -> usize {
        let semaphore = self.semaphore_for(operation).await;
        self.capacity.saturating_sub(semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_when_slots_available() {
        let bulkhead = Bulkhead::new(2, Duration::from_millis(50));
        let permit = bulkhead.acquire("op").await;
        assert!(permit.is_some());
    }

    #[tokio::test]
    async fn rejects_when_capacity_exhausted_and_timeout_elapses() {
        let bulkhead = Bulkhead::new(1, Duration::from_millis(20));
        let _held = bulkhead.acquire("op").await.unwrap();
        let second = bulkhead.acquire("op").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn releasing_a_permit_frees_the_slot() {
        let bulkhead = Bulkhead::new(1, Duration::from_millis(200));
        let held = bulkhead.acquire("op").await.unwrap();
        drop(held);
        let second = bulkhead.acquire("op").await;
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn capacity_one_serializes_strictly() {
        let bulkhead = Bulkhead::new(1, Duration::from_millis(500));
        let _first = bulkhead.acquire("op").await.unwrap();
        assert_eq!(bulkhead.in_flight("op").await, 1);
    }

    #[tokio::test]
    async fn slots_are_scoped_per_operation() {
        let bulkhead = Bulkhead::new(1, Duration::from_millis(20));
        let _held = bulkhead.acquire("op-a").await.unwrap();
        let other = bulkhead.acquire("op-b").await;
        assert!(other.is_some());
    }
}
