// SPDX-License-Identifier: PMPL-1.0-or-later

//! Loading engine configuration files

use std::fs;
use std::time::Duration;
use swarm_fuzz::backpressure::BackpressureStrategy;
use swarm_fuzz::{EngineConfig, Severity};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_yaml_overrides_merge_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "engine.yaml",
        r#"
pool:
  min_workers: 2
  max_workers: 8
  queue_size: 500
  scale_interval: 250ms
backpressure:
  strategy: drop_oldest
cache:
  ttl: 5m
report_severity: medium
"#,
    );
    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.pool.max_workers, 8);
    assert_eq!(config.pool.queue_size, 500);
    assert_eq!(config.pool.scale_interval, Duration::from_millis(250));
    assert_eq!(config.backpressure.strategy, BackpressureStrategy::DropOldest);
    assert_eq!(config.cache.ttl, Duration::from_secs(300));
    assert_eq!(config.report_severity, Severity::Medium);
    // Untouched sections keep their defaults.
    assert_eq!(config.analyzer.sample_count, 5);
    assert_eq!(config.similarity.minhash_permutations, 128);
}

#[test]
fn test_json_config_loads() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "engine.json",
        r#"{"rate_limit": {"enabled": true, "requests_per_second": 50, "burst": 5},
            "analyzer": {"sample_count": 3, "timing_threshold": 1.0}}"#,
    );
    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.rate_limit.burst, 5);
    assert_eq!(config.rate_limit.requests_per_second, 50.0);
    assert_eq!(config.analyzer.sample_count, 3);
}

#[test]
fn test_defaults_round_trip_through_yaml() {
    let dir = TempDir::new().unwrap();
    let yaml = EngineConfig::default().to_yaml().unwrap();
    let path = write(&dir, "defaults.yml", &yaml);
    let loaded = EngineConfig::load(&path).unwrap();
    assert_eq!(loaded.to_yaml().unwrap(), yaml);
}

#[test]
fn test_unknown_extension_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "engine.toml", "pool = {}");
    let err = EngineConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("unsupported"));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "bad.yaml",
        "backpressure:\n  high_watermark: 0.4\n  low_watermark: 0.6\n",
    );
    let err = EngineConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("watermarks"));

    let path = write(&dir, "bad-lsh.yaml", "similarity:\n  lsh_bands: 7\n");
    assert!(EngineConfig::load(&path).is_err());

    let path = write(&dir, "bad-duration.yaml", "cache:\n  ttl: soon\n");
    assert!(EngineConfig::load(&path).is_err());
}

#[test]
fn test_missing_file_names_path() {
    let dir = TempDir::new().unwrap();
    let err = EngineConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.to_string().contains("absent.yaml"));
}
