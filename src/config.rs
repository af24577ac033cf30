// SPDX-License-Identifier: PMPL-1.0-or-later

//! Engine configuration: one section per component, loadable from JSON or
//! YAML. Every field has a default so files only need the overrides.

use crate::analyzer::AnalyzerConfig;
use crate::backpressure::BackpressureConfig;
use crate::cache::{MemoryCacheConfig, SimilarityConfig};
use crate::error::{EngineError, EngineResult};
use crate::pool::WorkerPoolConfig;
use crate::types::Severity;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: WorkerPoolConfig,
    pub backpressure: BackpressureConfig,
    pub cache: MemoryCacheConfig,
    pub rate_limit: RateLimitConfig,
    pub analyzer: AnalyzerConfig,
    pub similarity: SimilarityConfig,
    /// Capacity of the anomaly feed and of the recent-error stack.
    pub feed_capacity: usize,
    /// Scored responses below this severity stay out of the feed.
    pub report_severity: Severity,
    /// At most one feed-overflow warning is logged per interval.
    #[serde(with = "duration_str")]
    pub overflow_log_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            backpressure: BackpressureConfig::default(),
            cache: MemoryCacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            analyzer: AnalyzerConfig::default(),
            similarity: SimilarityConfig::default(),
            feed_capacity: 4_096,
            report_severity: Severity::Low,
            overflow_log_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: EngineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing json engine config {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing yaml engine config {}", path.display()))?,
            _ => {
                return Err(anyhow!(
                    "unsupported engine config extension for {}",
                    path.display()
                ))
            }
        };
        config
            .validate()
            .with_context(|| format!("validating engine config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.pool.validate()?;
        self.backpressure.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        self.analyzer.validate()?;
        self.similarity.validate()?;
        if self.feed_capacity == 0 {
            return Err(EngineError::invalid("feed_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 1_000.0,
            burst: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(EngineError::invalid(
                "rate_limit.requests_per_second must be > 0",
            ));
        }
        if self.burst == 0 {
            return Err(EngineError::invalid("rate_limit.burst must be > 0"));
        }
        Ok(())
    }
}

/// Parses `"250ms"`, `"1.5s"`, `"5m"`, `"1h"`, `"20us"`, `"100ns"`; a bare
/// number means seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(anyhow!("duration cannot be empty"));
    }

    let (value_str, nanos_per_unit) = if let Some(v) = trimmed.strip_suffix("ns") {
        (v, 1.0)
    } else if let Some(v) = trimmed.strip_suffix("us") {
        (v, 1_000.0)
    } else if let Some(v) = trimmed.strip_suffix("ms") {
        (v, 1_000_000.0)
    } else if let Some(v) = trimmed.strip_suffix('s') {
        (v, 1e9)
    } else if let Some(v) = trimmed.strip_suffix('m') {
        (v, 60e9)
    } else if let Some(v) = trimmed.strip_suffix('h') {
        (v, 3_600e9)
    } else {
        (trimmed.as_str(), 1e9)
    };

    let value: f64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{}'", raw))?;
    if !value.is_finite() || value.is_sign_negative() {
        return Err(anyhow!("duration must be a non-negative number: {}", raw));
    }
    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

/// Shortest exact rendering in the largest whole unit.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    const UNITS: [(u128, &str); 6] = [
        (3_600_000_000_000, "h"),
        (60_000_000_000, "m"),
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];
    for (size, suffix) in UNITS {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, suffix);
        }
    }
    format!("{}ns", nanos)
}

/// Serde adapter writing durations as human strings.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("20us").unwrap(), Duration::from_micros(20));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn formats_in_largest_unit() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_micros(10)), "10us");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn rate_limit_disabled_skips_checks() {
        let config = RateLimitConfig {
            enabled: false,
            requests_per_second: 0.0,
            burst: 0,
        };
        assert!(config.validate().is_ok());
    }
}
