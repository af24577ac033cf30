// SPDX-License-Identifier: PMPL-1.0-or-later

//! The fuzzing pipeline: admission control, the worker pool, rate limiting
//! and response analysis wired together.
//!
//! ```text
//! submit -> backpressure -> pool queue -> worker
//!                                          |- rate limiter
//!                                          |- requester
//!                                          `- analyzer -> anomaly feed
//! ```

use crate::analyzer::{Analysis, Analyzer, AnalyzerStats, Observation};
use crate::backpressure::{BackpressureController, BackpressureStats, PressureDecision};
use crate::cache::{CacheStats, MemoryCache};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::pool::{PoolStats, WorkerPool};
use crate::sync::{AtomicCounter, LockFreeQueue, LockFreeStack};
use crate::throttle::{RateLimiter, RateLimiterStats, Throttle};
use crate::types::{AnomalyResult, Response, Severity, Task, TaskError, TaskId, TaskResult};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Performs the actual request for a task. Must honour `ctx` and must not
/// panic.
pub trait Requester: Send + Sync + 'static {
    fn execute(&self, ctx: &Context, task: &Task) -> Result<Response, TaskError>;
}

impl<F> Requester for F
where
    F: Fn(&Context, &Task) -> Result<Response, TaskError> + Send + Sync + 'static,
{
    fn execute(&self, ctx: &Context, task: &Task) -> Result<Response, TaskError> {
        self(ctx, task)
    }
}

/// A task whose request failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub target: String,
    pub error: TaskError,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub submitted: u64,
    /// Refused by the backpressure policy before reaching the pool.
    pub rejected: u64,
    pub anomalies_published: u64,
    /// Feed was full when the finding arrived.
    pub anomalies_discarded: u64,
    pub anomalies_pending: usize,
    pub errors_recorded: u64,
    pub errors_discarded: u64,
    /// Overflow warnings that made it past the log throttle.
    pub overflow_warnings: u64,
    pub pool: PoolStats,
    pub backpressure: BackpressureStats,
    pub cache: CacheStats,
    pub analyzer: AnalyzerStats,
    pub rate_limiter: Option<RateLimiterStats>,
}

impl EngineStats {
    /// Every submission that will never produce a result.
    pub fn dropped(&self) -> u64 {
        self.rejected + self.pool.tasks_dropped
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicCounter,
    rejected: AtomicCounter,
    anomalies_published: AtomicCounter,
    anomalies_discarded: AtomicCounter,
    errors_recorded: AtomicCounter,
    errors_discarded: AtomicCounter,
    overflow_warnings: AtomicCounter,
}

/// State shared with the worker-side handler.
struct Pipeline {
    requester: Box<dyn Requester>,
    limiter: Option<RateLimiter>,
    analyzer: Analyzer,
    anomalies: LockFreeQueue<AnomalyResult>,
    errors: LockFreeStack<TaskFailure>,
    report_severity: Severity,
    overflow_log: Throttle,
    counters: Counters,
}

impl Pipeline {
    fn run(&self, ctx: &Context, task: Task) -> TaskResult {
        if let Some(limiter) = &self.limiter {
            if let Err(err) = limiter.wait(ctx) {
                return TaskResult::failure(task.id, err.into(), Duration::ZERO);
            }
        }
        if task.is_expired() {
            return self.failed(&task, TaskError::Timeout, Duration::ZERO);
        }

        let started = Instant::now();
        let outcome = self.requester.execute(ctx, &task);
        let latency = started.elapsed();
        match outcome {
            Ok(response) => {
                let observation = Observation::new(
                    task.id,
                    task.target.clone(),
                    response.status,
                    response.body.clone(),
                    latency,
                );
                if let Analysis::Scored(result) = self.analyzer.analyze(&observation) {
                    self.publish(result);
                }
                TaskResult::success(task.id, response, latency)
            }
            Err(error) => self.failed(&task, error, latency),
        }
    }

    fn publish(&self, result: AnomalyResult) {
        if result.severity < self.report_severity {
            return;
        }
        match self.anomalies.push(result) {
            Ok(()) => {
                self.counters.anomalies_published.inc();
            }
            Err(result) => {
                self.counters.anomalies_discarded.inc();
                debug!(
                    "anomaly feed full, discarding {} finding for request {}",
                    result.severity.label(),
                    result.request_id
                );
                self.warn_overflow();
            }
        }
    }

    /// Summarises feed and error-stack overflow, at most once per
    /// `overflow_log_interval`.
    fn warn_overflow(&self) {
        if !self.overflow_log.allow() {
            return;
        }
        self.counters.overflow_warnings.inc();
        warn!(
            "engine feeds overflowing: {} findings and {} failures discarded so far",
            self.counters.anomalies_discarded.get(),
            self.counters.errors_discarded.get()
        );
    }

    fn failed(&self, task: &Task, error: TaskError, latency: Duration) -> TaskResult {
        let failure = TaskFailure {
            task_id: task.id,
            target: task.target.clone(),
            error: error.clone(),
            at: Utc::now(),
        };
        if self.errors.push(failure).is_ok() {
            self.counters.errors_recorded.inc();
        } else {
            self.counters.errors_discarded.inc();
            self.warn_overflow();
        }
        TaskResult::failure(task.id, error, latency)
    }
}

pub struct FuzzEngine {
    config: EngineConfig,
    pool: WorkerPool,
    backpressure: BackpressureController,
    pipeline: Arc<Pipeline>,
    cache: Arc<MemoryCache>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FuzzEngine {
    pub fn new<R: Requester>(config: EngineConfig, requester: R) -> EngineResult<Self> {
        config.validate()?;
        let cache = Arc::new(MemoryCache::new(config.cache.clone())?);
        let analyzer = Analyzer::new(
            config.analyzer.clone(),
            &config.similarity,
            Arc::clone(&cache),
        )?;
        let limiter = if config.rate_limit.enabled {
            Some(RateLimiter::per_second(
                config.rate_limit.requests_per_second,
                config.rate_limit.burst,
            )?)
        } else {
            None
        };
        let backpressure = BackpressureController::new(config.backpressure.clone())?;

        let pipeline = Arc::new(Pipeline {
            requester: Box::new(requester),
            limiter,
            analyzer,
            anomalies: LockFreeQueue::with_capacity(config.feed_capacity),
            errors: LockFreeStack::with_capacity(config.feed_capacity),
            report_severity: config.report_severity,
            overflow_log: Throttle::new(config.overflow_log_interval),
            counters: Counters::default(),
        });

        let handler_pipeline = Arc::clone(&pipeline);
        let pool = WorkerPool::new(config.pool.clone(), move |ctx: &Context, task: Task| {
            handler_pipeline.run(ctx, task)
        })?;
        let sweeper = match cache.start_sweeper(pool.context()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                pool.stop();
                return Err(err);
            }
        };

        info!(
            "engine ready: backpressure {:?}, rate limit {}",
            config.backpressure.strategy,
            if config.rate_limit.enabled {
                format!("{}/s", config.rate_limit.requests_per_second)
            } else {
                "off".to_string()
            }
        );

        Ok(Self {
            config,
            pool,
            backpressure,
            pipeline,
            cache,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.pipeline.analyzer
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    /// Queue length the backpressure policy measures against.
    pub fn effective_capacity(&self) -> usize {
        self.config
            .backpressure
            .max_queue_size
            .min(self.pool.queue_capacity())
    }

    fn admit(&self) -> PressureDecision {
        let decision = self
            .backpressure
            .check(self.pool.queue_len(), self.effective_capacity());
        self.apply(decision)
    }

    /// Admission whose adaptive slowdown gives up once `ctx` is done.
    fn admit_within(&self, ctx: &Context) -> EngineResult<PressureDecision> {
        let decision = self.backpressure.check_with(
            ctx,
            self.pool.queue_len(),
            self.effective_capacity(),
        )?;
        Ok(self.apply(decision))
    }

    fn apply(&self, decision: PressureDecision) -> PressureDecision {
        if decision == PressureDecision::EvictOldest && self.pool.evict_oldest() {
            debug!("evicted oldest queued task to admit a new one");
        }
        decision
    }

    /// Non-blocking submission through the backpressure policy. `false`
    /// means the task will never run.
    pub fn submit(&self, task: Task) -> bool {
        self.pipeline.counters.submitted.inc();
        if !self.admit().admits() {
            self.pipeline.counters.rejected.inc();
            return false;
        }
        self.pool.submit(task)
    }

    /// Blocks until the task's result arrives. Under the block strategy
    /// admission is retried until `ctx` is done.
    pub fn submit_wait(&self, ctx: &Context, task: Task) -> EngineResult<TaskResult> {
        self.pipeline.counters.submitted.inc();
        loop {
            let decision = match self.admit_within(ctx) {
                Ok(decision) => decision,
                Err(err) => {
                    self.pipeline.counters.rejected.inc();
                    return Err(err);
                }
            };
            match decision {
                PressureDecision::Admit | PressureDecision::EvictOldest => break,
                PressureDecision::Reject => {
                    self.pipeline.counters.rejected.inc();
                    return Err(EngineError::TaskDropped);
                }
                PressureDecision::Retry => {
                    let pause = self.backpressure.current_delay();
                    if let Err(err) = ctx.sleep(pause) {
                        self.pipeline.counters.rejected.inc();
                        return Err(err);
                    }
                }
            }
        }
        self.pool.submit_wait(ctx, task)
    }

    pub fn results(&self) -> crossbeam_channel::Receiver<TaskResult> {
        self.pool.results()
    }

    /// Up to `max` findings, oldest first.
    pub fn drain_anomalies(&self, max: usize) -> Vec<AnomalyResult> {
        std::iter::from_fn(|| self.pipeline.anomalies.pop())
            .take(max)
            .collect()
    }

    /// Removes and returns up to `n` recorded failures, newest first.
    pub fn recent_errors(&self, n: usize) -> Vec<TaskFailure> {
        std::iter::from_fn(|| self.pipeline.errors.pop())
            .take(n)
            .collect()
    }

    pub fn drain(&self, timeout: Duration) -> bool {
        self.pool.drain(timeout)
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.pipeline.counters;
        EngineStats {
            submitted: counters.submitted.get(),
            rejected: counters.rejected.get(),
            anomalies_published: counters.anomalies_published.get(),
            anomalies_discarded: counters.anomalies_discarded.get(),
            anomalies_pending: self.pipeline.anomalies.len(),
            errors_recorded: counters.errors_recorded.get(),
            errors_discarded: counters.errors_discarded.get(),
            overflow_warnings: counters.overflow_warnings.get(),
            pool: self.pool.stats(),
            backpressure: self.backpressure.stats(),
            cache: self.cache.stats(),
            analyzer: self.pipeline.analyzer.stats(),
            rate_limiter: self.pipeline.limiter.as_ref().map(RateLimiter::stats),
        }
    }

    /// Stops the pool (cancel, then join) and the cache sweeper.
    pub fn stop(&self) {
        self.pool.stop();
        if let Some(handle) = self.sweeper.lock().take() {
            if handle.join().is_err() {
                warn!("cache sweeper panicked");
            }
        }
    }
}

impl Drop for FuzzEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
