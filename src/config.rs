//! Configuration for the resilient adapter and saga coordinator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable parameters for one `ResilientAdapter` instance (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Maximum duration of one operation attempt
    #[serde(with = "duration_millis")]
    pub per_attempt_timeout: Duration,

    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,

    /// Backoff envelope lower bound
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Backoff envelope upper bound
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// How long the breaker stays OPEN before permitting a probe
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,

    /// Maximum concurrent in-flight invocations
    pub bulkhead_capacity: usize,

    /// Time to wait for a bulkhead slot before rejecting
    #[serde(with = "duration_millis")]
    pub bulkhead_acquire_timeout: Duration,

    /// TTL applied to cached idempotent results
    #[serde(with = "duration_millis")]
    pub idempotency_ttl: Duration,
}

impl AdapterConfig {
    /// Validate the configuration, mirroring the invariants spec.md §8
    /// calls out as boundary behaviors (e.g. `max_attempts >= 1`).
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.bulkhead_capacity == 0 {
            return Err("bulkhead_capacity must be >= 1".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be >= 1".to_string());
        }
        Ok(())
    }

    /// Load configuration from a JSON or TOML file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, crate::error::AdapterError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::error::AdapterError::Config(e.to_string()))?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| crate::error::AdapterError::Config(e.to_string()))?,
            _ => return Err(crate::error::AdapterError::Config("unsupported config file format".to_string())),
        };
        Ok(config)
    }

    /// Save configuration to a JSON or TOML file.
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), crate::error::AdapterError> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)
                .map_err(|e| crate::error::AdapterError::Config(e.to_string()))?,
            _ => return Err(crate::error::AdapterError::Config("unsupported config file format".to_string())),
        };
        std::fs::write(path, content).map_err(|e| crate::error::AdapterError::Config(e.to_string()))?;
        Ok(())
    }
}

impl Default for AdapterConfig {
    /// Matches the original `create_api_adapter` defaults (spec.md's
    /// "medium timeout, medium concurrency, tolerant breaker" profile).
    fn default() -> Self {
        Self {
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
}

/// Tunable parameters for the saga coordinator (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Default TTL for persisted saga records
    #[serde(with = "duration_millis")]
    pub saga_ttl: Duration,

    /// Default per-step timeout when a step doesn't specify its own
    #[serde(with = "duration_millis")]
    pub default_step_timeout: Duration,

    /// Upper bound on step-retry backoff (spec.md §4.2: "bounded by a
    /// reasonable cap <= 10s")
    #[serde(with = "duration_millis")]
    pub max_step_backoff: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_ttl: Duration::from_secs(7 * 24 * 3600),
            default_step_timeout: Duration::from_secs(30),
            max_step_backoff: Duration::from_secs(10),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
