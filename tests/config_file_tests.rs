//! `AdapterConfig` file round-trips through real JSON/TOML files on
//! disk, using `tempfile` the way the teacher's
//! `tests/unified_storage_tests.rs` does for file-backed fixtures.

use reliant_saga::AdapterConfig;
use std::time::Duration;

fn sample_config() -> AdapterConfig {
    AdapterConfig {
        per_attempt_timeout: Duration::from_secs(7),
        max_attempts: 5,
        base_delay: Duration::from_millis(250),
        max_delay: Duration::from_secs(9),
        failure_threshold: 4,
        recovery_timeout: Duration::from_secs(30),
        bulkhead_capacity: 12,
        bulkhead_acquire_timeout: Duration::from_millis(500),
        idempotency_ttl: Duration::from_secs(1800),
    }
}

#[test]
fn json_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.json");
    let config = sample_config();

    config.to_file(&path).unwrap();
    let restored = AdapterConfig::from_file(&path).unwrap();

    assert_eq!(restored.max_attempts, config.max_attempts);
    assert_eq!(restored.per_attempt_timeout, config.per_attempt_timeout);
    assert_eq!(restored.bulkhead_capacity, config.bulkhead_capacity);
}

#[test]
fn toml_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.toml");
    let config = sample_config();

    config.to_file(&path).unwrap();
    let restored = AdapterConfig::from_file(&path).unwrap();

    assert_eq!(restored.failure_threshold, config.failure_threshold);
    assert_eq!(restored.recovery_timeout, config.recovery_timeout);
    assert!(restored.validate().is_ok());
}

#[test]
fn unsupported_extension_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapter.yaml");
    std::fs::write(&path, "max_attempts: 3").unwrap();

    let result = AdapterConfig::from_file(&path);
    assert!(result.is_err());
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist.json");
    assert!(AdapterConfig::from_file(&path).is_err());
}
