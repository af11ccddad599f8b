//! Per-operation statistics (spec.md §3 `AdapterStats`, §4.1, §8 I-2)

use crate::breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one operation. Monotonic except on explicit
/// reset (spec.md §3).
#[derive(Default)]
pub struct AdapterStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
    bulkhead_rejections: AtomicU64,
}

/// Read-only point-in-time view, suitable for a caller-owned exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub bulkhead_rejections: u64,
    pub circuit_state: CircuitState,
}

impl AdapterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retries(&self, n: u32) {
        self.retries.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn incr_circuit_rejections(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_bulkhead_rejections(&self) {
        self.bulkhead_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, circuit_state: CircuitState) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
            circuit_state,
        }
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.circuit_rejections.store(0, Ordering::Relaxed);
        self.bulkhead_rejections.store(0, Ordering::Relaxed);
    }
}

impl AdapterStatsSnapshot {
    /// Invariant I-2 (spec.md §8): terminal outcomes never exceed total.
    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed + self.timed_out + self.circuit_rejections + self.bulkhead_rejections
            <= self.total
    }
}
