//! Saga coordinator: ordered or parallel sequences of side-effecting
//! steps, with reverse- or declared-order compensation on failure
//! (spec.md §4.2).
//!
//! Each step runs through its own short-lived `ResilientAdapter`,
//! scoped `saga:{saga_id}` / op `{step_id}`, so step retries reuse the
//! same timeout/backoff/idempotency-cache machinery as any other
//! operation instead of a second, parallel retry implementation.
//! Compensation is invoked directly, at most once per completed step,
//! per spec.md §1's non-goal against retrying compensations.

use crate::adapter::{Operation, ResilientAdapter};
use crate::config::{AdapterConfig, SagaConfig};
use crate::error::{AdapterError, Result};
use crate::event_log::EventLog;
use crate::kvs::KeyValueStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A saga step's compensating action: undoes a completed step, given
/// its forward result (spec.md §6 "Compensation").
///
/// Only the forward result is threaded through explicitly; the
/// original inputs spec.md §6 also mentions reach a compensation by
/// closure capture at construction time rather than as a parameter
/// here, since a step's inputs are already known to whoever builds it.
#[async_trait]
pub trait Compensation: Send + Sync {
    async fn compensate(&self, result: &serde_json::Value) -> Result<()>;
}

/// Execution order for a saga's steps (spec.md §3 `Saga.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaMode {
    Sequential,
    Parallel,
}

/// Order in which completed steps are offered to compensation
/// (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationPolicy {
    ReverseOrder,
    DeclaredOrder,
}

/// Status of one step within a saga (spec.md §3; `CompensationFailed`
/// is a supplement grounded on the teacher's
/// `SagaStepState::CompensationFailed`, needed so a step whose own
/// compensation raised can still be reported distinctly from one that
/// was never attempted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
    CompensationFailed,
}

/// Status of a saga as a whole (spec.md §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
    CompensationFailed,
}

/// One step of a saga: a forward action and an optional compensation,
/// with its own retry budget (spec.md §3 `SagaStep`).
pub struct SagaStep {
    pub step_id: String,
    pub name: String,
    pub execute: Arc<dyn Operation<Output = serde_json::Value>>,
    pub compensate: Option<Arc<dyn Compensation>>,
    pub per_step_timeout: Duration,
    pub max_step_retries: u32,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Clone for SagaStep {
    fn clone(&self) -> Self {
        Self {
            step_id: self.step_id.clone(),
            name: self.name.clone(),
            execute: Arc::clone(&self.execute),
            compensate: self.compensate.clone(),
            per_step_timeout: self.per_step_timeout,
            max_step_retries: self.max_step_retries,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// A serializable view of one step, used for persistence and status
/// reporting (never carries the `execute`/`compensate` closures).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepSnapshot {
    fn from_step(step: &SagaStep) -> Self {
        Self {
            step_id: step.step_id.clone(),
            name: step.name.clone(),
            status: step.status,
            result: step.result.clone(),
            error: step.error.clone(),
            started_at: step.started_at,
            completed_at: step.completed_at,
        }
    }
}

/// A saga: an ordered (or parallel) sequence of steps belonging to one
/// tenant (spec.md §3 `Saga`).
#[derive(Clone)]
pub struct Saga {
    pub saga_id: String,
    pub tenant_id: String,
    pub name: String,
    pub steps: Vec<SagaStep>,
    pub mode: SagaMode,
    pub compensation_policy: CompensationPolicy,
    pub status: SagaStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl Saga {
    pub fn snapshot(&self) -> SagaSnapshot {
        SagaSnapshot {
            saga_id: self.saga_id.clone(),
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            mode: self.mode,
            compensation_policy: self.compensation_policy,
            status: self.status,
            steps: self.steps.iter().map(StepSnapshot::from_step).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Structural status of a saga without its closures, safe to persist
/// or hand to an observability caller (spec.md §4.2 `status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaSnapshot {
    pub saga_id: String,
    pub tenant_id: String,
    pub name: String,
    pub mode: SagaMode,
    pub compensation_policy: CompensationPolicy,
    pub status: SagaStatus,
    pub steps: Vec<StepSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Result of one `execute` call (spec.md §4.2: `(success, step_results)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaOutcome {
    pub success: bool,
    pub step_results: Vec<serde_json::Value>,
}

/// Aggregate counters across all sagas a coordinator has handled
/// (supplement grounded on `saga_orchestrator.py::get_saga_statistics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaMetricsSnapshot {
    pub total_sagas: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub compensating: u64,
    pub compensated: u64,
    pub failed: u64,
    pub compensation_failed: u64,
    pub success_rate: f64,
}

/// Coordinates execution and compensation of sagas, persisting each
/// one's state to a shared `KeyValueStore` (spec.md §4.2).
pub struct SagaCoordinator {
    kvs: Arc<dyn KeyValueStore>,
    event_log: Arc<dyn EventLog>,
    config: SagaConfig,
    sagas: Mutex<HashMap<String, Saga>>,
}

impl SagaCoordinator {
    pub fn new(kvs: Arc<dyn KeyValueStore>, event_log: Arc<dyn EventLog>, config: SagaConfig) -> Self {
        Self {
            kvs,
            event_log,
            config,
            sagas: Mutex::new(HashMap::new()),
        }
    }

    /// Create a saga record; `saga_id` defaults to a generated UUID.
    pub async fn create_saga(
        &self,
        saga_id: Option<String>,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        mode: SagaMode,
        compensation_policy: CompensationPolicy,
        metadata: HashMap<String, String>,
    ) -> String {
        let saga_id = saga_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let saga = Saga {
            saga_id: saga_id.clone(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            steps: Vec::new(),
            mode,
            compensation_policy,
            status: SagaStatus::Pending,
            created_at: now,
            updated_at: now,
            metadata,
        };
        self.persist(&saga).await;
        self.sagas.lock().await.insert(saga_id.clone(), saga);
        saga_id
    }

    /// Append a step to a saga that has not yet been executed.
    pub async fn add_step(
        &self,
        saga_id: &str,
        step_id: impl Into<String>,
        name: impl Into<String>,
        execute: Arc<dyn Operation<Output = serde_json::Value>>,
        compensate: Option<Arc<dyn Compensation>>,
        per_step_timeout: Duration,
        max_step_retries: u32,
    ) -> Result<()> {
        let snapshot_saga = {
            let mut guard = self.sagas.lock().await;
            let saga = guard
                .get_mut(saga_id)
                .ok_or_else(|| AdapterError::SagaNotFound(saga_id.to_string()))?;
            saga.steps.push(SagaStep {
                step_id: step_id.into(),
                name: name.into(),
                execute,
                compensate,
                per_step_timeout,
                max_step_retries,
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            });
            saga.updated_at = Utc::now();
            saga.clone()
        };
        self.persist(&snapshot_saga).await;
        Ok(())
    }

    /// Run the saga to a terminal status. Re-invoking after a prior
    /// terminal run returns the same outcome without re-running steps
    /// (spec.md §8's idempotence law for sagas).
    pub async fn execute(&self, saga_id: &str) -> Result<SagaOutcome> {
        self.execute_inner(saga_id, None).await
    }

    /// Run the saga to a terminal status, but bound the whole saga to
    /// `timeout`. On expiry the in-flight step (or, in PARALLEL mode,
    /// every still-running step) is cancelled and treated as failed,
    /// then the normal compensation path runs for whatever completed
    /// beforehand (spec.md §5 "whole-saga timeout").
    pub async fn execute_with_timeout(&self, saga_id: &str, timeout: Duration) -> Result<SagaOutcome> {
        self.execute_inner(saga_id, Some(Instant::now() + timeout)).await
    }

    async fn execute_inner(&self, saga_id: &str, deadline: Option<Instant>) -> Result<SagaOutcome> {
        let mut saga = {
            let guard = self.sagas.lock().await;
            guard
                .get(saga_id)
                .cloned()
                .ok_or_else(|| AdapterError::SagaNotFound(saga_id.to_string()))?
        };

        if let Some(outcome) = terminal_outcome(&saga) {
            debug!(saga_id, "saga already terminal, returning cached outcome");
            return Ok(outcome);
        }

        info!(saga_id, mode = ?saga.mode, steps = saga.steps.len(), "starting saga");
        saga.status = SagaStatus::Running;
        saga.updated_at = Utc::now();
        self.persist(&saga).await;
        self.sagas.lock().await.insert(saga_id.to_string(), saga.clone());

        let outcome = match saga.mode {
            SagaMode::Sequential => self.execute_sequential(&mut saga, deadline).await,
            SagaMode::Parallel => self.execute_parallel(&mut saga, deadline).await,
        };

        saga.updated_at = Utc::now();
        info!(saga_id, status = ?saga.status, "saga finished");
        self.persist(&saga).await;
        self.sagas.lock().await.insert(saga_id.to_string(), saga);

        Ok(outcome)
    }

    /// Structural status snapshot for observability.
    pub async fn status(&self, saga_id: &str) -> Option<SagaSnapshot> {
        self.sagas.lock().await.get(saga_id).map(Saga::snapshot)
    }

    /// Remove the saga from both the in-memory registry and the KVS.
    pub async fn cleanup(&self, saga_id: &str) -> Result<()> {
        let tenant_id = self.sagas.lock().await.remove(saga_id).map(|s| s.tenant_id);
        if let Some(tenant_id) = tenant_id {
            self.kvs.delete(&saga_key(&tenant_id, saga_id)).await?;
        }
        Ok(())
    }

    /// Aggregate counters across every saga this coordinator has seen.
    pub async fn metrics(&self) -> SagaMetricsSnapshot {
        let guard = self.sagas.lock().await;
        let mut m = SagaMetricsSnapshot {
            total_sagas: guard.len() as u64,
            pending: 0,
            running: 0,
            completed: 0,
            compensating: 0,
            compensated: 0,
            failed: 0,
            compensation_failed: 0,
            success_rate: 0.0,
        };
        for saga in guard.values() {
            match saga.status {
                SagaStatus::Pending => m.pending += 1,
                SagaStatus::Running => m.running += 1,
                SagaStatus::Completed => m.completed += 1,
                SagaStatus::Compensating => m.compensating += 1,
                SagaStatus::Compensated => m.compensated += 1,
                SagaStatus::Failed => m.failed += 1,
                SagaStatus::CompensationFailed => m.compensation_failed += 1,
            }
        }
        m.success_rate = if m.total_sagas == 0 {
            0.0
        } else {
            m.completed as f64 / m.total_sagas as f64
        };
        m
    }

    async fn execute_sequential(&self, saga: &mut Saga, deadline: Option<Instant>) -> SagaOutcome {
        let mut results = Vec::new();
        for index in 0..saga.steps.len() {
            let outcome = match deadline {
                None => self.run_step(saga, index).await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.cancel_step(saga, index);
                        self.compensate(saga).await;
                        return SagaOutcome {
                            success: false,
                            step_results: results,
                        };
                    }
                    match tokio::time::timeout(remaining, self.run_step(saga, index)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(saga_id = %saga.saga_id, step = %saga.steps[index].step_id, "saga timed out mid-step");
                            self.cancel_step(saga, index);
                            self.compensate(saga).await;
                            return SagaOutcome {
                                success: false,
                                step_results: results,
                            };
                        }
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    results.push(value);
                    self.persist(saga).await;
                }
                Err(_) => {
                    self.compensate(saga).await;
                    return SagaOutcome {
                        success: false,
                        step_results: results,
                    };
                }
            }
        }
        saga.status = SagaStatus::Completed;
        SagaOutcome {
            success: true,
            step_results: results,
        }
    }

    /// Mark a step that never reached a terminal status as failed due
    /// to whole-saga timeout cancellation (spec.md §5).
    fn cancel_step(&self, saga: &mut Saga, index: usize) {
        let now = Utc::now();
        let step = &mut saga.steps[index];
        if step.started_at.is_none() {
            step.started_at = Some(now);
        }
        step.status = StepStatus::Failed;
        step.error = Some(AdapterError::Cancelled.to_string());
        step.completed_at = Some(now);
    }

    async fn execute_parallel(&self, saga: &mut Saga, deadline: Option<Instant>) -> SagaOutcome {
        let saga_id = saga.saga_id.clone();
        let tasks = saga.steps.iter().map(|step| {
            let adapter = self.adapter_for_step(&saga_id, step);
            let op_name = step.step_id.clone();
            let execute = Arc::clone(&step.execute);
            async move {
                let started_at = Utc::now();
                let result = adapter.execute(&op_name, &serde_json::Value::Null, execute).await;
                (started_at, Utc::now(), result)
            }
        });

        let outcomes = match deadline {
            None => join_all(tasks).await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, join_all(tasks)).await {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        warn!(saga_id = %saga.saga_id, "saga timed out with steps still in flight");
                        for index in 0..saga.steps.len() {
                            if saga.steps[index].completed_at.is_none() {
                                self.cancel_step(saga, index);
                            }
                        }
                        self.persist(saga).await;
                        self.compensate(saga).await;
                        return SagaOutcome {
                            success: false,
                            step_results: Vec::new(),
                        };
                    }
                }
            }
        };

        let mut results = Vec::new();
        let mut any_failed = false;
        for (index, (started_at, completed_at, outcome)) in outcomes.into_iter().enumerate() {
            let step = &mut saga.steps[index];
            step.started_at = Some(started_at);
            step.completed_at = Some(completed_at);
            match outcome {
                Ok(value) => {
                    step.status = StepStatus::Completed;
                    step.result = Some(value.clone());
                    results.push(value);
                }
                Err(err) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(err.to_string());
                    any_failed = true;
                }
            }
        }
        self.persist(saga).await;

        if any_failed {
            self.compensate(saga).await;
            SagaOutcome {
                success: false,
                step_results: results,
            }
        } else {
            saga.status = SagaStatus::Completed;
            SagaOutcome {
                success: true,
                step_results: results,
            }
        }
    }

    async fn run_step(&self, saga: &mut Saga, index: usize) -> Result<serde_json::Value> {
        let saga_id = saga.saga_id.clone();
        let adapter = self.adapter_for_step(&saga_id, &saga.steps[index]);
        let op_name = saga.steps[index].step_id.clone();
        let execute = Arc::clone(&saga.steps[index].execute);

        {
            let step = &mut saga.steps[index];
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        }
        debug!(saga_id, step = %op_name, "running saga step");

        let result = adapter.execute(&op_name, &serde_json::Value::Null, execute).await;

        let step = &mut saga.steps[index];
        step.completed_at = Some(Utc::now());
        match &result {
            Ok(value) => {
                step.status = StepStatus::Completed;
                step.result = Some(value.clone());
            }
            Err(err) => {
                step.status = StepStatus::Failed;
                step.error = Some(err.to_string());
                warn!(saga_id, step = %op_name, error = %err, "saga step failed");
            }
        }
        result
    }

    /// Walk every step whose status is COMPLETED, in the saga's
    /// compensation-policy order, invoking its compensation at most
    /// once. Best-effort: a failing compensation is recorded but does
    /// not stop the remaining ones from being attempted.
    async fn compensate(&self, saga: &mut Saga) {
        saga.status = SagaStatus::Compensating;
        self.persist(saga).await;

        let mut completed: Vec<usize> = saga
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(i, _)| i)
            .collect();

        if completed.is_empty() {
            saga.status = SagaStatus::Failed;
            return;
        }

        if saga.compensation_policy == CompensationPolicy::ReverseOrder {
            completed.reverse();
        }

        let mut any_failed = false;
        for index in completed {
            let compensation = saga.steps[index].compensate.clone();
            let Some(compensation) = compensation else {
                continue;
            };
            let result = saga.steps[index]
                .result
                .clone()
                .unwrap_or(serde_json::Value::Null);
            let timeout = saga.steps[index].per_step_timeout;
            let step_name = saga.steps[index].name.clone();

            info!(saga_id = %saga.saga_id, step = %step_name, "compensating saga step");
            let outcome = tokio::time::timeout(timeout, compensation.compensate(&result)).await;

            let step = &mut saga.steps[index];
            match outcome {
                Ok(Ok(())) => {
                    step.status = StepStatus::Compensated;
                }
                Ok(Err(err)) => {
                    any_failed = true;
                    step.status = StepStatus::CompensationFailed;
                    step.error = Some(err.to_string());
                    error!(saga_id = %saga.saga_id, step = %step_name, error = %err, "compensation failed");
                }
                Err(_) => {
                    any_failed = true;
                    step.status = StepStatus::CompensationFailed;
                    step.error = Some(format!("compensation for '{step_name}' timed out"));
                    error!(saga_id = %saga.saga_id, step = %step_name, "compensation timed out");
                }
            }
            self.persist(saga).await;
        }

        saga.status = if any_failed {
            SagaStatus::CompensationFailed
        } else {
            SagaStatus::Compensated
        };
    }

    /// Build a short-lived adapter scoped to this saga, parameterizing
    /// its retry/timeout behavior from the step's own budget (spec.md
    /// §9's "choose one level of retry authority per step": the saga's
    /// per-step config replaces rather than stacks on the adapter's
    /// own, and the breaker/bulkhead are left effectively disabled
    /// since a single step instance is invoked at most once per saga
    /// execution).
    fn adapter_for_step(&self, saga_id: &str, step: &SagaStep) -> ResilientAdapter {
        let config = AdapterConfig {
            per_attempt_timeout: step.per_step_timeout,
            max_attempts: step.max_step_retries + 1,
            base_delay: Duration::from_millis(100),
            max_delay: self.config.max_step_backoff,
            failure_threshold: u32::MAX,
            recovery_timeout: self.config.max_step_backoff,
            bulkhead_capacity: 1,
            bulkhead_acquire_timeout: step.per_step_timeout,
            idempotency_ttl: self.config.saga_ttl,
        };
        ResilientAdapter::new(
            format!("saga:{saga_id}"),
            config,
            Arc::clone(&self.kvs),
            Arc::clone(&self.event_log),
        )
    }

    async fn persist(&self, saga: &Saga) {
        let snapshot = saga.snapshot();
        let key = saga_key(&saga.tenant_id, &saga.saga_id);
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = self.kvs.set(&key, bytes, self.config.saga_ttl).await {
                    warn!(saga_id = %saga.saga_id, error = %err, "failed to persist saga state");
                }
            }
            Err(err) => warn!(saga_id = %saga.saga_id, error = %err, "failed to serialize saga snapshot"),
        }
    }
}

fn saga_key(tenant_id: &str, saga_id: &str) -> String {
    format!("saga:{tenant_id}:{saga_id}")
}

fn terminal_outcome(saga: &Saga) -> Option<SagaOutcome> {
    match saga.status {
        SagaStatus::Completed => Some(SagaOutcome {
            success: true,
            step_results: saga.steps.iter().filter_map(|s| s.result.clone()).collect(),
        }),
        SagaStatus::Compensated | SagaStatus::CompensationFailed | SagaStatus::Failed => Some(SagaOutcome {
            success: false,
            step_results: saga
                .steps
                .iter()
                .filter(|s| s.result.is_some())
                .filter_map(|s| s.result.clone())
                .collect(),
        }),
        _ => None,
    }
}
