// SPDX-License-Identifier: PMPL-1.0-or-later

//! Pool counters and their snapshot form.

use crate::config::duration_str;
use crate::sync::AtomicCounter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted: AtomicCounter,
    pub completed: AtomicCounter,
    pub failed: AtomicCounter,
    pub dropped: AtomicCounter,
    pub cancelled: AtomicCounter,
    pub results_discarded: AtomicCounter,
    pub spawned: AtomicCounter,
    pub retired: AtomicCounter,
    pub latency_nanos: AtomicCounter,
}

/// Point-in-time copy of the pool's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    /// Completed, but the handler reported an error.
    pub tasks_failed: u64,
    pub tasks_dropped: u64,
    /// Queued when the pool stopped; completed without running the handler.
    pub tasks_cancelled: u64,
    pub results_discarded: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
    pub current_workers: u64,
    pub in_flight: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
    #[serde(with = "duration_str")]
    pub average_latency: Duration,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queue_len as f64 / self.queue_capacity as f64
    }

    /// Accepted tasks that have not produced a result yet.
    pub fn outstanding(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_dropped)
            .saturating_sub(self.tasks_completed)
            .saturating_sub(self.tasks_cancelled)
    }
}

impl PoolCounters {
    pub fn average_latency(&self) -> Duration {
        let completed = self.completed.get();
        if completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.latency_nanos.get() / completed)
    }
}
