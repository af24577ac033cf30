// SPDX-License-Identifier: PMPL-1.0-or-later

//! Typed engine errors.
//!
//! Capacity conditions (queue full, cache over capacity) are reported as
//! `bool` returns and counted in stats. Only cancellation and construction
//! problems surface as [`EngineError`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The governing context was cancelled explicitly.
    #[error("operation cancelled")]
    Cancelled,

    /// The governing context passed its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The pool has been stopped and accepts no more work.
    #[error("worker pool is stopped")]
    PoolStopped,

    /// The task was accepted and later evicted before a worker ran it.
    #[error("task dropped before execution")]
    TaskDropped,

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// Rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig(message.into())
    }

    /// True for the errors a caller may retry or abandon (cancel/deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::DeadlineExceeded)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_class() {
        assert!(EngineError::Cancelled.is_cancellation());
        assert!(EngineError::DeadlineExceeded.is_cancellation());
        assert!(!EngineError::PoolStopped.is_cancellation());
        assert!(!EngineError::invalid("x").is_cancellation());
    }

    #[test]
    fn messages_are_readable() {
        assert_eq!(
            EngineError::invalid("max_workers must be > 0").to_string(),
            "invalid configuration: max_workers must be > 0"
        );
    }
}
