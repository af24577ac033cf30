// SPDX-License-Identifier: PMPL-1.0-or-later

//! Worker pool sizing and scaling policy.

use crate::config::duration_str;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    #[serde(with = "duration_str")]
    pub scale_interval: Duration,
    /// Queue utilisation above which one worker is added per tick.
    pub scale_up_threshold: f64,
    /// Queue utilisation below which one idle worker is retired per tick.
    pub scale_down_threshold: f64,
    /// How often an idle worker wakes to check for retirement.
    #[serde(with = "duration_str")]
    pub idle_poll: Duration,
    /// Capacity of the result channel; defaults to `queue_size`.
    pub result_buffer: Option<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            min_workers: cpus,
            max_workers: cpus * 4,
            queue_size: 10_000,
            scale_interval: Duration::from_secs(1),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            idle_poll: Duration::from_millis(50),
            result_buffer: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_workers == 0 {
            return Err(EngineError::invalid("pool max_workers must be > 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(EngineError::invalid(format!(
                "pool min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_size == 0 {
            return Err(EngineError::invalid("pool queue_size must be > 0"));
        }
        if self.scale_interval.is_zero() || self.idle_poll.is_zero() {
            return Err(EngineError::invalid(
                "pool scale_interval and idle_poll must be > 0",
            ));
        }
        if !(0.0 <= self.scale_down_threshold
            && self.scale_down_threshold < self.scale_up_threshold
            && self.scale_up_threshold <= 1.0)
        {
            return Err(EngineError::invalid(format!(
                "scale thresholds must satisfy 0 <= down ({}) < up ({}) <= 1",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.result_buffer == Some(0) {
            return Err(EngineError::invalid("pool result_buffer must be > 0"));
        }
        Ok(())
    }

    pub fn result_capacity(&self) -> usize {
        self.result_buffer.unwrap_or(self.queue_size)
    }

    /// Fixed-size pool: `workers` threads, no scaling.
    pub fn fixed(workers: usize, queue_size: usize) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            queue_size,
            ..Default::default()
        }
    }
}
