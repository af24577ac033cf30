// SPDX-License-Identifier: PMPL-1.0-or-later

//! swarm-fuzz: the concurrent core of a stateful web-security fuzzer.
//!
//! Mutated requests are dispatched by a dynamically scaled worker pool under
//! backpressure and rate control; every response is scored against a learned
//! per-target baseline, and near-duplicate findings are clustered with
//! SimHash and MinHash.
//!
//! ENGINE PILLARS:
//! 1. **Pool**: bounded queue, autoscaled workers, cancel-then-join shutdown.
//! 2. **Admission**: watermark backpressure plus a token-bucket limiter.
//! 3. **Cache**: byte-bounded LRU, exact fingerprints, SimHash/MinHash/LSH.
//! 4. **Analyzer**: Welford baselines and severity scoring.

pub mod analyzer;
pub mod backpressure;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod pool;
pub mod sync;
pub mod throttle;
pub mod types;

pub use config::EngineConfig;
pub use context::Context;
pub use engine::{EngineStats, FuzzEngine, Requester, TaskFailure};
pub use error::{EngineError, EngineResult};
pub use types::{AnomalyResult, Response, Severity, Task, TaskError, TaskId, TaskResult};
