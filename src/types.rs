// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core type definitions shared across the engine.

use crate::config::duration_str;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

pub type TaskId = u64;

/// One unit of fuzzing work: a target plus an opaque mutated payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub priority: u8,
    /// Enforced by the requester, not by the pool.
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Task {
    pub fn new(id: TaskId, target: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            target: target.into(),
            payload: payload.into(),
            priority: 0,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A timeout too large to represent leaves the task without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// What the requester got back from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Failure reported by a handler. Carried inside [`TaskResult`], never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    #[error("cancelled before completion")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<crate::error::EngineError> for TaskError {
    fn from(err: crate::error::EngineError) -> Self {
        use crate::error::EngineError;
        match err {
            EngineError::DeadlineExceeded => TaskError::Timeout,
            EngineError::Cancelled | EngineError::PoolStopped | EngineError::TaskDropped => {
                TaskError::Cancelled
            }
            EngineError::InvalidConfig(msg) | EngineError::WorkerSpawn(msg) => {
                TaskError::Rejected(msg)
            }
        }
    }
}

/// Outcome of exactly one accepted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub response: Option<Response>,
    pub error: Option<TaskError>,
    #[serde(with = "duration_str")]
    pub latency: Duration,
}

impl TaskResult {
    pub fn success(task_id: TaskId, response: Response, latency: Duration) -> Self {
        Self {
            task_id,
            response: Some(response),
            error: None,
            latency,
        }
    }

    pub fn failure(task_id: TaskId, error: TaskError, latency: Duration) -> Self {
        Self {
            task_id,
            response: None,
            error: Some(error),
            latency,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A response scored against its target's baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub request_id: TaskId,
    pub target: String,
    pub status: u16,
    /// Hamming distance (0..=64) between the response and baseline SimHashes.
    pub structural_distance: u32,
    /// Response time divided by the baseline mean.
    pub time_skew: f64,
    pub length_delta: i64,
    pub crashed: bool,
    pub status_changed: bool,
    pub timing_anomaly: bool,
    pub evidence: String,
    pub severity: Severity,
    /// Earlier finding this one nearly duplicates.
    pub similar_to: Option<TaskId>,
    pub detected_at: DateTime<Utc>,
}
