// SPDX-License-Identifier: PMPL-1.0-or-later

//! Watermark-based backpressure policy.
//!
//! The controller never touches a queue. Whoever owns the queue reports its
//! length and capacity and acts on the returned [`PressureDecision`].

use crate::config::duration_str;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::sync::{AtomicCounter, AtomicDuration, AtomicF64, AtomicFlag};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Refuse admission; the caller retries later.
    Block,
    /// Refuse admission and count the task as dropped.
    Drop,
    /// Admit, after the caller evicts its oldest queued item.
    DropOldest,
    /// Admit after sleeping for an adaptive delay.
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub strategy: BackpressureStrategy,
    /// Upper bound used as queue capacity when it is tighter than the pool's.
    pub max_queue_size: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    /// Requests per second at the longest adaptive delay.
    pub min_rate: f64,
    /// Requests per second at the shortest adaptive delay.
    pub max_rate: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            strategy: BackpressureStrategy::Adaptive,
            max_queue_size: 10_000,
            high_watermark: 0.8,
            low_watermark: 0.5,
            min_rate: 10.0,
            max_rate: 1_000.0,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_queue_size == 0 {
            return Err(EngineError::invalid("backpressure max_queue_size must be > 0"));
        }
        if !(self.low_watermark > 0.0
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(EngineError::invalid(format!(
                "watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                self.low_watermark, self.high_watermark
            )));
        }
        if !(self.min_rate.is_finite() && self.min_rate > 0.0 && self.min_rate <= self.max_rate)
            || !self.max_rate.is_finite()
        {
            return Err(EngineError::invalid(format!(
                "rates must satisfy 0 < min_rate ({}) <= max_rate ({})",
                self.min_rate, self.max_rate
            )));
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_rate)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.min_rate)
    }
}

/// What the queue owner should do with the item it wants to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureDecision {
    Admit,
    /// Make room by evicting the oldest queued item, then admit.
    EvictOldest,
    /// Not admitted; try again later.
    Retry,
    /// Not admitted; already counted as dropped.
    Reject,
}

impl PressureDecision {
    pub fn admits(self) -> bool {
        matches!(self, PressureDecision::Admit | PressureDecision::EvictOldest)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureStats {
    pub checks: u64,
    pub pressure_events: u64,
    pub dropped: u64,
    pub blocked: u64,
    pub drop_oldest_signals: u64,
    pub slowdowns: u64,
    pub pressure: f64,
    pub pressured: bool,
    #[serde(with = "duration_str")]
    pub current_delay: Duration,
}

#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    min_delay: Duration,
    max_delay: Duration,
    pressured: AtomicFlag,
    pressure: AtomicF64,
    delay: AtomicDuration,
    checks: AtomicCounter,
    pressure_events: AtomicCounter,
    dropped: AtomicCounter,
    blocked: AtomicCounter,
    drop_oldest_signals: AtomicCounter,
    slowdowns: AtomicCounter,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> EngineResult<Self> {
        config.validate()?;
        let min_delay = config.min_delay();
        let max_delay = config.max_delay();
        Ok(Self {
            config,
            min_delay,
            max_delay,
            pressured: AtomicFlag::new(false),
            pressure: AtomicF64::new(0.0),
            delay: AtomicDuration::new(min_delay),
            checks: AtomicCounter::new(),
            pressure_events: AtomicCounter::new(),
            dropped: AtomicCounter::new(),
            blocked: AtomicCounter::new(),
            drop_oldest_signals: AtomicCounter::new(),
            slowdowns: AtomicCounter::new(),
        })
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Returns whether the caller may enqueue now.
    pub fn check_pressure(&self, queue_len: usize, queue_cap: usize) -> bool {
        self.check(queue_len, queue_cap).admits()
    }

    /// Decides admission. An adaptive slowdown sleeps the calling thread.
    pub fn check(&self, queue_len: usize, queue_cap: usize) -> PressureDecision {
        let (decision, pause) = self.decide(queue_len, queue_cap);
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
        decision
    }

    /// Like [`check`](Self::check), but an adaptive slowdown ends early with
    /// the context's error once `ctx` is done.
    pub fn check_with(
        &self,
        ctx: &Context,
        queue_len: usize,
        queue_cap: usize,
    ) -> EngineResult<PressureDecision> {
        let (decision, pause) = self.decide(queue_len, queue_cap);
        if !pause.is_zero() {
            ctx.sleep(pause)?;
        }
        Ok(decision)
    }

    /// The decision plus how long the caller should pause before acting.
    fn decide(&self, queue_len: usize, queue_cap: usize) -> (PressureDecision, Duration) {
        self.checks.inc();
        let pressure = if queue_cap == 0 {
            1.0
        } else {
            (queue_len as f64 / queue_cap as f64).min(1.0)
        };
        self.pressure.store(pressure);

        if pressure < self.config.high_watermark {
            if pressure < self.config.low_watermark {
                if self.pressured.lower() {
                    info!(
                        "backpressure released at {:.2} (low watermark {:.2})",
                        pressure, self.config.low_watermark
                    );
                }
                let floor = self.min_delay;
                self.delay.update(|d| (d / 2).max(floor));
            }
            return (PressureDecision::Admit, Duration::ZERO);
        }

        if self.pressured.raise() {
            self.pressure_events.inc();
            warn!(
                "backpressure engaged at {:.2} (high watermark {:.2}, strategy {:?})",
                pressure, self.config.high_watermark, self.config.strategy
            );
        }

        match self.config.strategy {
            BackpressureStrategy::Block => {
                self.blocked.inc();
                (PressureDecision::Retry, Duration::ZERO)
            }
            BackpressureStrategy::Drop => {
                self.dropped.inc();
                (PressureDecision::Reject, Duration::ZERO)
            }
            BackpressureStrategy::DropOldest => {
                self.drop_oldest_signals.inc();
                (PressureDecision::EvictOldest, Duration::ZERO)
            }
            BackpressureStrategy::Adaptive => {
                let ceiling = self.max_delay;
                let current = self.delay.load();
                self.delay
                    .update(|d| d.checked_mul(2).unwrap_or(ceiling).min(ceiling));
                self.slowdowns.inc();
                (PressureDecision::Admit, current)
            }
        }
    }

    pub fn is_pressured(&self) -> bool {
        self.pressured.is_set()
    }

    pub fn current_delay(&self) -> Duration {
        self.delay.load()
    }

    pub fn reset(&self) {
        self.pressured.lower();
        self.pressure.store(0.0);
        self.delay.store(self.min_delay);
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            checks: self.checks.get(),
            pressure_events: self.pressure_events.get(),
            dropped: self.dropped.get(),
            blocked: self.blocked.get(),
            drop_oldest_signals: self.drop_oldest_signals.get(),
            slowdowns: self.slowdowns.get(),
            pressure: self.pressure.load(),
            pressured: self.pressured.is_set(),
            current_delay: self.delay.load(),
        }
    }
}
