// SPDX-License-Identifier: PMPL-1.0-or-later

//! Token-bucket admission control.
//!
//! Tokens are refilled lazily from elapsed wall-clock time on every call, so
//! a limiter costs no background thread.

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::sync::AtomicCounter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    /// Time to earn one token.
    interval: Duration,
    burst: f64,
    bucket: Mutex<Bucket>,
    allowed: AtomicCounter,
    denied: AtomicCounter,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub available: f64,
    pub burst: u32,
}

impl RateLimiter {
    /// One token per `interval`, holding at most `burst` tokens.
    pub fn new(interval: Duration, burst: u32) -> EngineResult<Self> {
        if interval.is_zero() {
            return Err(EngineError::invalid("rate limiter interval must be > 0"));
        }
        if burst == 0 {
            return Err(EngineError::invalid("rate limiter burst must be > 0"));
        }
        Ok(Self {
            interval,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
            allowed: AtomicCounter::new(),
            denied: AtomicCounter::new(),
        })
    }

    pub fn per_second(requests_per_second: f64, burst: u32) -> EngineResult<Self> {
        if !(requests_per_second.is_finite() && requests_per_second > 0.0) {
            return Err(EngineError::invalid(
                "requests_per_second must be a positive number",
            ));
        }
        Self::new(Duration::from_secs_f64(1.0 / requests_per_second), burst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = elapsed.as_secs_f64() / self.interval.as_secs_f64();
        bucket.tokens = (bucket.tokens + earned).min(self.burst);
        bucket.last_refill = now;
    }

    /// Takes a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            drop(bucket);
            self.allowed.inc();
            true
        } else {
            drop(bucket);
            self.denied.inc();
            false
        }
    }

    /// Blocks until a token is taken or `ctx` is done.
    pub fn wait(&self, ctx: &Context) -> EngineResult<()> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if self.allow() {
                return Ok(());
            }
            ctx.sleep(self.interval)?;
        }
    }

    /// Tokens currently in the bucket after refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.get(),
            denied: self.denied.get(),
            available: self.available(),
            burst: self.burst as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_deny() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 3).unwrap();
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        let stats = limiter.stats();
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.denied, 1);
    }

    #[test]
    fn refills_after_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(20), 1).unwrap();
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.allow());
    }

    #[test]
    fn tokens_cap_at_burst() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 2).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.available() <= 2.0);
    }

    #[test]
    fn wait_honours_cancellation() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 1).unwrap();
        assert!(limiter.allow());
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert_eq!(limiter.wait(&ctx), Err(EngineError::DeadlineExceeded));
    }

    #[test]
    fn wait_acquires_when_token_arrives() {
        let limiter = RateLimiter::new(Duration::from_millis(10), 1).unwrap();
        assert!(limiter.allow());
        assert!(limiter.wait(&Context::background()).is_ok());
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(RateLimiter::new(Duration::ZERO, 1).is_err());
        assert!(RateLimiter::new(Duration::from_millis(1), 0).is_err());
        assert!(RateLimiter::per_second(0.0, 1).is_err());
        assert!(RateLimiter::per_second(f64::NAN, 1).is_err());
    }
}
