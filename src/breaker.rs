//! Circuit breaker (spec.md §4.1)
//!
//! One breaker per logical `OperationID`, never per closure identity
//! (spec.md §9, Open question 2). State lives in process memory behind
//! a mutex small enough to hold while reading `Instant::now()`.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Externally observable breaker state for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }
}

/// Outcome of an entry check: whether the caller may proceed, and
/// whether this entry is the single HALF_OPEN probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    Proceed { probing: bool },
    Reject,
}

/// Per-`OperationID` circuit breaker registry.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Step 3 of the entry algorithm (spec.md §4.1).
    pub async fn check_entry(&self, operation: &str) -> EntryDecision {
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(operation.to_string()).or_insert_with(BreakerEntry::new);
        let now = Instant::now();

        match entry.state {
            CircuitState::Closed => EntryDecision::Proceed { probing: false },
            CircuitState::Open => {
                let deadline = entry.next_attempt_at.unwrap_or(now);
                if now >= deadline {
                    entry.state = CircuitState::HalfOpen;
                    info!(operation, "circuit breaker transitioning to half-open");
                    EntryDecision::Proceed { probing: true }
                } else {
                    EntryDecision::Reject
                }
            }
            CircuitState::HalfOpen => EntryDecision::Proceed { probing: true },
        }
    }

    /// Step 6 of the entry algorithm: record a success.
    pub async fn record_success(&self, operation: &str) {
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(operation.to_string()).or_insert_with(BreakerEntry::new);
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Closed;
                entry.consecutive_failures = 0;
                entry.next_attempt_at = None;
                info!(operation, "circuit breaker closed after successful probe");
            }
            CircuitState::Closed => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_sub(1);
            }
            CircuitState::Open => {
                // A stale success racing a probe must not reset an open breaker.
            }
        }
    }

    /// Step 7 of the entry algorithm: record a failure.
    pub async fn record_failure(&self, operation: &str) {
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(operation.to_string()).or_insert_with(BreakerEntry::new);
        let now = Instant::now();

        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.next_attempt_at = Some(now + self.recovery_timeout);
                    warn!(
                        operation,
                        consecutive_failures = entry.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.next_attempt_at = Some(now + self.recovery_timeout);
                warn!(operation, "circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, for `AdapterStats` snapshots.
    pub async fn state(&self, operation: &str) -> CircuitState {
        let guard = self.entries.lock().await;
        guard
            .get(operation)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset to the initial CLOSED state, for `reset_stats`.
    pub async fn reset(&self, operation: &str) {
        let mut guard = self.entries.lock().await;
        guard.insert(operation.to_string(), BreakerEntry::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_breaker_always_admits() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        assert_eq!(
            breaker.check_entry("op").await,
            EntryDecision::Proceed { probing: false }
        );
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record_failure("op").await;
        }
        assert_eq!(breaker.state("op").await, CircuitState::Open);
        assert_eq!(breaker.check_entry("op").await, EntryDecision::Reject);
    }

    #[tokio::test]
    async fn probes_exactly_once_after_recovery_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure("op").await;
        assert_eq!(breaker.state("op").await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            breaker.check_entry("op").await,
            EntryDecision::Proceed { probing: true }
        );
        assert_eq!(breaker.state("op").await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn successful_probe_closes_breaker() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("op").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.check_entry("op").await;
        breaker.record_success("op").await;
        assert_eq!(breaker.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens_immediately() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("op").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.check_entry("op").await;
        breaker.record_failure("op").await;
        assert_eq!(breaker.state("op").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_state_decrements_without_going_negative() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        breaker.record_success("op").await;
        assert_eq!(breaker.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn breakers_are_scoped_per_operation() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("op-a").await;
        assert_eq!(breaker.state("op-a").await, CircuitState::Open);
        assert_eq!(breaker.state("op-b").await, CircuitState::Closed);
    }
}
