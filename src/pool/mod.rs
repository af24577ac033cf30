// SPDX-License-Identifier: PMPL-1.0-or-later

//! Dynamically scaled worker pool over a bounded task queue.

mod config;
mod stats;
mod worker;

pub use config::WorkerPoolConfig;
pub use stats::PoolStats;
pub use worker::{ScaleAction, WorkerPool};

use crate::context::Context;
use crate::types::{Task, TaskResult};

/// Runs one task. Invoked by every worker for every dequeued task.
///
/// Implementations must not panic and should return promptly once `ctx` is
/// done; the pool installs no guard of its own.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &Context, task: Task) -> TaskResult;
}

impl<F> TaskHandler for F
where
    F: Fn(&Context, Task) -> TaskResult + Send + Sync + 'static,
{
    fn handle(&self, ctx: &Context, task: Task) -> TaskResult {
        self(ctx, task)
    }
}
