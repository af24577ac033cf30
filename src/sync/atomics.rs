// SPDX-License-Identifier: PMPL-1.0-or-later

//! Small atomic building blocks used by the stats structs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic `u64` counter. Readers see a plain copy.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge that never wraps below zero.
#[derive(Debug, Default)]
pub struct AtomicGauge(AtomicU64);

impl AtomicGauge {
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec(&self) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Increments only while the value stays `<= max`. Returns whether it did.
    pub fn inc_bounded(&self, max: u64) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements only while the value stays `>= min`. Returns whether it did.
    pub fn dec_bounded(&self, min: u64) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current <= min {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Boolean flag whose `raise` reports whether this call did the transition.
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub const fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    /// Sets the flag; true only for the caller that flipped it false -> true.
    #[inline]
    pub fn raise(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the flag; true only for the caller that flipped it true -> false.
    #[inline]
    pub fn lower(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// `f64` stored as raw bits.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Duration held as whole nanoseconds.
#[derive(Debug, Default)]
pub struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub fn new(value: Duration) -> Self {
        Self(AtomicU64::new(saturating_nanos(value)))
    }

    #[inline]
    pub fn load(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, value: Duration) {
        self.0.store(saturating_nanos(value), Ordering::Release);
    }

    /// Atomically replaces the value with `f(current)`; returns the new value.
    pub fn update(&self, f: impl Fn(Duration) -> Duration) -> Duration {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = saturating_nanos(f(Duration::from_nanos(current)));
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Duration::from_nanos(next),
                Err(actual) => current = actual,
            }
        }
    }
}

pub(crate) fn saturating_nanos(value: Duration) -> u64 {
    u64::try_from(value.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn flag_transitions_once() {
        let flag = AtomicFlag::new(false);
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_set());
        assert!(flag.lower());
        assert!(!flag.lower());
    }

    #[test]
    fn gauge_never_underflows() {
        let gauge = AtomicGauge::new(0);
        assert_eq!(gauge.dec(), 0);
        gauge.inc();
        assert_eq!(gauge.dec(), 0);
    }

    #[test]
    fn bounded_gauge_respects_limits() {
        let gauge = Arc::new(AtomicGauge::new(2));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gauge = gauge.clone();
                thread::spawn(move || gauge.inc_bounded(5))
            })
            .collect();
        let grown = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(grown, 3);
        assert_eq!(gauge.get(), 5);
        assert!(gauge.dec_bounded(4));
        assert!(!gauge.dec_bounded(4));
    }

    #[test]
    fn duration_update_saturates() {
        let d = AtomicDuration::new(Duration::from_millis(10));
        let doubled = d.update(|v| (v * 2).min(Duration::from_millis(15)));
        assert_eq!(doubled, Duration::from_millis(15));
        assert_eq!(saturating_nanos(Duration::MAX), u64::MAX);
    }
}
