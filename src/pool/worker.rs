// SPDX-License-Identifier: PMPL-1.0-or-later

//! Worker threads, the autoscaler and the pool handle that owns them.

use super::config::WorkerPoolConfig;
use super::stats::{PoolCounters, PoolStats};
use super::TaskHandler;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::sync::atomics::saturating_nanos;
use crate::sync::{AtomicCounter, AtomicFlag, AtomicGauge};
use crate::types::{Task, TaskError, TaskResult};
use crossbeam_channel::{
    bounded, select, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(5);

struct Job {
    task: Task,
    /// Present for `submit_wait`; the result goes here instead of `results()`.
    reply: Option<Sender<TaskResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

struct Shared {
    config: WorkerPoolConfig,
    handler: Box<dyn TaskHandler>,
    ctx: Context,
    queue: Receiver<Job>,
    /// Never written; disconnects when the pool stops so idle workers wake.
    shutdown: Receiver<()>,
    /// Template sender cloned into each new worker; taken on stop.
    results: Mutex<Option<Sender<TaskResult>>>,
    counters: PoolCounters,
    workers: AtomicGauge,
    retire_requests: AtomicGauge,
    in_flight: AtomicGauge,
    /// Accepted tasks without a delivered outcome.
    pending: AtomicGauge,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicCounter,
}

impl Shared {
    fn run(&self, job: Job, results: &Sender<TaskResult>) {
        self.in_flight.inc();
        let task_id = job.task.id;
        let started = Instant::now();
        let mut result = self.handler.handle(&self.ctx, job.task);
        let elapsed = started.elapsed();

        result.task_id = task_id;
        if result.latency.is_zero() {
            result.latency = elapsed;
        }
        self.counters.completed.inc();
        if !result.is_ok() {
            self.counters.failed.inc();
        }
        self.counters
            .latency_nanos
            .add(saturating_nanos(result.latency));

        self.deliver(job.reply, result, Some(results));
        self.in_flight.dec();
        self.pending.dec();
    }

    fn deliver(
        &self,
        reply: Option<Sender<TaskResult>>,
        result: TaskResult,
        results: Option<&Sender<TaskResult>>,
    ) {
        match reply {
            // Capacity one and a single send: never blocks. A waiter that
            // gave up has dropped its receiver and the result goes nowhere.
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                let published = results.map(|tx| tx.try_send(result).is_ok());
                if published != Some(true) {
                    self.counters.results_discarded.inc();
                }
            }
        }
    }

    fn try_retire(&self) -> bool {
        if !self.retire_requests.dec_bounded(0) {
            return false;
        }
        if self.workers.dec_bounded(self.config.min_workers as u64) {
            self.counters.retired.inc();
            true
        } else {
            false
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: u64, results: Sender<TaskResult>) {
    debug!("worker {} started", id);
    loop {
        if shared.ctx.is_done() {
            break;
        }
        select! {
            recv(shared.queue) -> job => match job {
                Ok(job) => shared.run(job, &results),
                Err(_) => break,
            },
            recv(shared.shutdown) -> _ => break,
            default(shared.config.idle_poll) => {
                if shared.try_retire() {
                    debug!("worker {} retired", id);
                    return;
                }
            }
        }
    }
    shared.workers.dec();
    debug!("worker {} stopped", id);
}

fn spawn_worker(shared: &Arc<Shared>) -> EngineResult<bool> {
    if !shared.workers.inc_bounded(shared.config.max_workers as u64) {
        return Ok(false);
    }
    let results = match shared.results.lock().clone() {
        Some(tx) => tx,
        None => {
            shared.workers.dec();
            return Ok(false);
        }
    };
    let id = shared.next_worker_id.inc();
    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("swarm-worker-{}", id))
        .spawn(move || worker_loop(worker_shared, id, results));
    match spawned {
        Ok(handle) => {
            let mut handles = shared.handles.lock();
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
            shared.counters.spawned.inc();
            Ok(true)
        }
        Err(err) => {
            shared.workers.dec();
            Err(EngineError::WorkerSpawn(err.to_string()))
        }
    }
}

fn autoscale(shared: &Arc<Shared>) -> ScaleAction {
    let config = &shared.config;
    let utilization = shared.queue.len() as f64 / config.queue_size as f64;
    let current = shared.workers.get();

    if utilization > config.scale_up_threshold {
        // Undo a pending retirement before paying for a new thread.
        if shared.retire_requests.dec_bounded(0) {
            return ScaleAction::Up;
        }
        if current < config.max_workers as u64 {
            match spawn_worker(shared) {
                Ok(true) => {
                    debug!(
                        "scaled up to {} workers (utilisation {:.2})",
                        shared.workers.get(),
                        utilization
                    );
                    return ScaleAction::Up;
                }
                Ok(false) => {}
                Err(err) => warn!("scale up failed: {}", err),
            }
        }
    } else if utilization < config.scale_down_threshold {
        let pending = shared.retire_requests.get();
        if current.saturating_sub(pending) > config.min_workers as u64 {
            shared.retire_requests.inc();
            debug!(
                "retiring one of {} workers (utilisation {:.2})",
                current, utilization
            );
            return ScaleAction::Down;
        }
    }
    ScaleAction::Hold
}

fn scaler_loop(shared: Arc<Shared>) {
    while shared.ctx.sleep(shared.config.scale_interval).is_ok() {
        autoscale(&shared);
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    submit: RwLock<Option<Sender<Job>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    results: Receiver<TaskResult>,
    scaler: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicFlag,
}

impl WorkerPool {
    pub fn new<H: TaskHandler>(config: WorkerPoolConfig, handler: H) -> EngineResult<Self> {
        Self::with_context(&Context::background(), config, handler)
    }

    /// Builds a pool whose lifetime is also bounded by `parent`.
    pub fn with_context<H: TaskHandler>(
        parent: &Context,
        config: WorkerPoolConfig,
        handler: H,
    ) -> EngineResult<Self> {
        config.validate()?;
        let (queue_tx, queue_rx) = bounded(config.queue_size);
        let (results_tx, results_rx) = bounded(config.result_capacity());
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let shared = Arc::new(Shared {
            handler: Box::new(handler),
            ctx: parent.with_cancel(),
            queue: queue_rx,
            shutdown: shutdown_rx,
            results: Mutex::new(Some(results_tx)),
            counters: PoolCounters::default(),
            workers: AtomicGauge::new(0),
            retire_requests: AtomicGauge::new(0),
            in_flight: AtomicGauge::new(0),
            pending: AtomicGauge::new(0),
            handles: Mutex::new(Vec::new()),
            next_worker_id: AtomicCounter::new(),
            config,
        });

        let pool = WorkerPool {
            shared: Arc::clone(&shared),
            submit: RwLock::new(Some(queue_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            results: results_rx,
            scaler: Mutex::new(None),
            stopped: AtomicFlag::new(false),
        };

        for _ in 0..shared.config.min_workers {
            if let Err(err) = spawn_worker(&shared) {
                pool.stop();
                return Err(err);
            }
        }

        let scaler_shared = Arc::clone(&shared);
        match thread::Builder::new()
            .name("swarm-scaler".to_string())
            .spawn(move || scaler_loop(scaler_shared))
        {
            Ok(handle) => *pool.scaler.lock() = Some(handle),
            Err(err) => {
                pool.stop();
                return Err(EngineError::WorkerSpawn(err.to_string()));
            }
        }

        info!(
            "worker pool started: {} workers (min {}, max {}), queue {}",
            shared.workers.get(),
            shared.config.min_workers,
            shared.config.max_workers,
            shared.config.queue_size
        );
        Ok(pool)
    }

    /// Enqueues without blocking. `false` means the task was not accepted
    /// and will never produce a result.
    pub fn submit(&self, task: Task) -> bool {
        let counters = &self.shared.counters;
        counters.submitted.inc();
        let guard = self.submit.read();
        let Some(tx) = guard.as_ref() else {
            counters.dropped.inc();
            return false;
        };
        self.shared.pending.inc();
        match tx.try_send(Job { task, reply: None }) {
            Ok(()) => true,
            Err(_) => {
                self.shared.pending.dec();
                counters.dropped.inc();
                false
            }
        }
    }

    /// Enqueues and blocks the caller until the task's result arrives or
    /// `ctx` is done. A result that arrives after cancellation is discarded.
    pub fn submit_wait(&self, ctx: &Context, task: Task) -> EngineResult<TaskResult> {
        let counters = &self.shared.counters;
        counters.submitted.inc();
        let (reply_tx, reply_rx) = bounded(1);
        let mut job = Job {
            task,
            reply: Some(reply_tx),
        };

        loop {
            if let Some(err) = ctx.err() {
                counters.dropped.inc();
                return Err(err);
            }
            // The read lock is released between attempts so `stop` is never
            // held up by a caller waiting for queue space.
            let guard = self.submit.read();
            let Some(tx) = guard.as_ref() else {
                counters.dropped.inc();
                return Err(EngineError::PoolStopped);
            };
            self.shared.pending.inc();
            match tx.send_timeout(job, WAIT_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    self.shared.pending.dec();
                    job = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.shared.pending.dec();
                    counters.dropped.inc();
                    return Err(EngineError::PoolStopped);
                }
            }
        }

        loop {
            match reply_rx.recv_timeout(WAIT_POLL) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(err) = ctx.err() {
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::TaskDropped),
            }
        }
    }

    /// Removes the oldest queued task, counting it as dropped.
    pub fn evict_oldest(&self) -> bool {
        match self.shared.queue.try_recv() {
            Ok(job) => {
                self.shared.pending.dec();
                self.shared.counters.dropped.inc();
                debug!("evicted queued task {}", job.task.id);
                true
            }
            Err(_) => false,
        }
    }

    /// Unordered, best-effort stream of results from `submit`.
    pub fn results(&self) -> Receiver<TaskResult> {
        self.results.clone()
    }

    /// Waits until every accepted task has produced its result.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.shared.pending.get() == 0 {
                return true;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Runs one autoscaling decision immediately.
    pub fn scale_once(&self) -> ScaleAction {
        if self.is_stopped() {
            return ScaleAction::Hold;
        }
        autoscale(&self.shared)
    }

    /// Cancels the pool context, joins every worker, then tears down the
    /// channels. Tasks still queued complete with [`TaskError::Cancelled`].
    pub fn stop(&self) {
        if !self.stopped.raise() {
            return;
        }
        // Seal the producer side; no submit can be mid-send past this point.
        let sender = self.submit.write().take();
        self.shared.ctx.cancel();
        drop(self.shutdown.lock().take());

        if let Some(scaler) = self.scaler.lock().take() {
            if scaler.join().is_err() {
                warn!("autoscaler thread panicked");
            }
        }
        // Joined before any channel is released.
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        let results = self.shared.results.lock().take();
        let mut cancelled = 0u64;
        while let Ok(job) = self.shared.queue.try_recv() {
            cancelled += 1;
            self.shared.counters.cancelled.inc();
            let result = TaskResult::failure(job.task.id, TaskError::Cancelled, Duration::ZERO);
            self.shared.deliver(job.reply, result, results.as_ref());
            self.shared.pending.dec();
        }
        drop(sender);
        drop(results);

        let counters = &self.shared.counters;
        info!(
            "worker pool stopped: {} completed, {} dropped, {} cancelled",
            counters.completed.get(),
            counters.dropped.get(),
            cancelled
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn current_workers(&self) -> usize {
        self.shared.workers.get() as usize
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.config.queue_size
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.get() as usize
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            tasks_submitted: counters.submitted.get(),
            tasks_completed: counters.completed.get(),
            tasks_failed: counters.failed.get(),
            tasks_dropped: counters.dropped.get(),
            tasks_cancelled: counters.cancelled.get(),
            results_discarded: counters.results_discarded.get(),
            workers_spawned: counters.spawned.get(),
            workers_retired: counters.retired.get(),
            current_workers: self.shared.workers.get(),
            in_flight: self.shared.in_flight.get(),
            queue_len: self.shared.queue.len(),
            queue_capacity: self.shared.config.queue_size,
            average_latency: counters.average_latency(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
